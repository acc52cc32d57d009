/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Retry policy applied to failed backend attempts.
//!
//! A [`RetryPolicy`] answers two questions for the execution engine: whether
//! a given failure deserves another attempt, and how long to wait before it.
//! Backend timeouts and cancellations are never retried regardless of the
//! configured condition.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// How the delay grows between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `initial_delay`.
    Fixed,
    /// Wait `initial_delay * attempt * multiplier`.
    Linear { multiplier: f64 },
    /// Wait `initial_delay * multiplier * base^(attempt - 1)`.
    Exponential { base: f64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed
    }
}

/// Which failures are eligible for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryCondition {
    Never,
    /// Any failure except timeouts and cancellation.
    AllErrors,
    /// Only failures the backend classified as transient.
    TransientOnly,
    /// Failures whose message contains one of the patterns.
    ErrorPattern { patterns: Vec<String> },
}

impl Default for RetryCondition {
    fn default() -> Self {
        RetryCondition::TransientOnly
    }
}

/// Attempt budget and backoff for one job.
///
/// `max_attempts` counts every backend attempt, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub retry_condition: RetryCondition,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            backoff_strategy: BackoffStrategy::Fixed,
            retry_condition: RetryCondition::TransientOnly,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            retry_condition: RetryCondition::Never,
            ..Self::default()
        }
    }

    /// Returns true when `error`, raised by attempt number `attempt`
    /// (1-based), should be followed by another attempt.
    pub fn should_retry(&self, error: &BackendError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        match error {
            BackendError::Timeout(_) | BackendError::Cancelled(_) => false,
            _ => match &self.retry_condition {
                RetryCondition::Never => false,
                RetryCondition::AllErrors => true,
                RetryCondition::TransientOnly => error.is_transient(),
                RetryCondition::ErrorPattern { patterns } => {
                    let message = error.to_string();
                    patterns.iter().any(|p| message.contains(p.as_str()))
                }
            },
        }
    }

    /// Delay to wait after attempt number `attempt` (1-based) failed.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_secs = self.initial_delay.as_secs_f64();

        let secs = match &self.backoff_strategy {
            BackoffStrategy::Fixed => base_secs,
            BackoffStrategy::Linear { multiplier } => base_secs * attempt as f64 * multiplier,
            BackoffStrategy::Exponential { base, multiplier } => {
                base_secs * multiplier * base.powi(attempt as i32 - 1)
            }
        };

        let capped = if secs.is_finite() {
            secs.clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };

        let delay = Duration::from_secs_f64(capped);
        if self.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    // +/- 25%, never above max_delay.
    fn add_jitter(&self, delay: Duration) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.backoff_strategy = strategy;
        self
    }

    pub fn retry_condition(mut self, condition: RetryCondition) -> Self {
        self.policy.retry_condition = condition;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> BackendError {
        BackendError::Transient("connection reset".into())
    }

    #[test]
    fn test_attempt_budget_counts_first_attempt() {
        let policy = RetryPolicy::builder().max_attempts(3).build();
        assert!(policy.should_retry(&transient(), 1));
        assert!(policy.should_retry(&transient(), 2));
        assert!(!policy.should_retry(&transient(), 3));
    }

    #[test]
    fn test_transient_only_skips_permanent_errors() {
        let policy = RetryPolicy::default();
        let permanent = BackendError::Permanent("column \"x\" does not exist".into());
        assert!(!policy.should_retry(&permanent, 1));
        assert!(policy.should_retry(&transient(), 1));
    }

    #[test]
    fn test_timeouts_are_never_retried() {
        let policy = RetryPolicy::builder()
            .retry_condition(RetryCondition::AllErrors)
            .max_attempts(10)
            .build();
        assert!(!policy.should_retry(&BackendError::Timeout("slow".into()), 1));
        assert!(!policy.should_retry(&BackendError::Cancelled("stop".into()), 1));
        assert!(policy.should_retry(&BackendError::Permanent("boom".into()), 1));
    }

    #[test]
    fn test_error_pattern_condition() {
        let policy = RetryPolicy::builder()
            .retry_condition(RetryCondition::ErrorPattern {
                patterns: vec!["deadlock".into()],
            })
            .build();
        assert!(policy.should_retry(&BackendError::Permanent("deadlock detected".into()), 1));
        assert!(!policy.should_retry(&BackendError::Permanent("syntax error".into()), 1));
    }

    #[test]
    fn test_backoff_strategies() {
        let fixed = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(10))
            .build();
        assert_eq!(fixed.calculate_delay(1), Duration::from_secs(10));
        assert_eq!(fixed.calculate_delay(4), Duration::from_secs(10));

        let linear = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(10))
            .backoff_strategy(BackoffStrategy::Linear { multiplier: 1.0 })
            .build();
        assert_eq!(linear.calculate_delay(3), Duration::from_secs(30));

        let exponential = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .backoff_strategy(BackoffStrategy::Exponential {
                base: 2.0,
                multiplier: 1.0,
            })
            .build();
        assert_eq!(exponential.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(exponential.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(exponential.calculate_delay(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(8))
            .max_delay(Duration::from_secs(60))
            .with_jitter(true)
            .build();
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(6) && delay <= Duration::from_secs(10));
        }
    }
}
