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

//! Configuration types for the [`Scheduler`](super::Scheduler).

use std::time::Duration;

use crate::executor::{BackoffStrategy, ExecutorConfig, RetryCondition, RetryPolicy};

/// Configuration for the scheduler loop and its worker pool.
///
/// # Construction
///
/// ```rust,ignore
/// let config = SchedulerConfig::builder()
///     .check_interval(Duration::from_secs(30))
///     .max_concurrent_jobs(4)
///     .max_retries(5)
///     .build();
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SchedulerConfig {
    check_interval: Duration,
    max_concurrent_jobs: usize,
    job_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    backoff: BackoffStrategy,
    max_retry_delay: Option<Duration>,
    retry_condition: RetryCondition,
    retry_jitter: bool,
    shutdown_grace_period: Duration,
    max_catchup_minutes: u32,
    stale_job_threshold: Option<Duration>,
    result_retention: Option<Duration>,
    write_retries: u32,
    write_retry_delay: Duration,
}

impl SchedulerConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Time between two ticks.
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Upper bound on jobs holding `running` at once.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Wall-clock ceiling for one job, retries included.
    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Total backend attempts per job, the first one included.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }

    /// Cap on a single backoff delay; defaults to the job timeout.
    pub fn max_retry_delay(&self) -> Duration {
        self.max_retry_delay.unwrap_or(self.job_timeout)
    }

    pub fn retry_condition(&self) -> &RetryCondition {
        &self.retry_condition
    }

    pub fn retry_jitter(&self) -> bool {
        self.retry_jitter
    }

    /// How long shutdown waits for cancelled jobs before aborting them.
    pub fn shutdown_grace_period(&self) -> Duration {
        self.shutdown_grace_period
    }

    /// Most minutes a single tick looks back after a delay.
    pub fn max_catchup_minutes(&self) -> u32 {
        self.max_catchup_minutes
    }

    /// Age after which a non-terminal job is considered abandoned.
    /// Defaults to twice the job timeout.
    pub fn stale_job_threshold(&self) -> Duration {
        self.stale_job_threshold
            .unwrap_or(self.job_timeout.saturating_mul(2))
    }

    /// How long terminal jobs are kept; `None` keeps them forever.
    pub fn result_retention(&self) -> Option<Duration> {
        self.result_retention
    }

    pub fn write_retries(&self) -> u32 {
        self.write_retries
    }

    pub fn write_retry_delay(&self) -> Duration {
        self.write_retry_delay
    }

    /// The retry policy handed to the execution engine.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_retries)
            .initial_delay(self.retry_delay)
            .max_delay(self.max_retry_delay())
            .backoff_strategy(self.backoff.clone())
            .retry_condition(self.retry_condition.clone())
            .with_jitter(self.retry_jitter)
            .build()
    }

    /// The worker pool settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            job_timeout: self.job_timeout,
            retry_policy: self.retry_policy(),
            write_retries: self.write_retries,
            write_retry_delay: self.write_retry_delay,
        }
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl Default for SchedulerConfigBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig {
                check_interval: Duration::from_secs(60),
                max_concurrent_jobs: 10,
                job_timeout: Duration::from_secs(3600),
                max_retries: 3,
                retry_delay: Duration::from_secs(60),
                backoff: BackoffStrategy::Fixed,
                max_retry_delay: None,
                retry_condition: RetryCondition::TransientOnly,
                retry_jitter: false,
                shutdown_grace_period: Duration::from_secs(30),
                max_catchup_minutes: 5,
                stale_job_threshold: None,
                result_retention: None,
                write_retries: 3,
                write_retry_delay: Duration::from_secs(1),
            },
        }
    }
}

impl SchedulerConfigBuilder {
    /// Sets the tick interval. Sub-second values are raised to one second.
    pub fn check_interval(mut self, value: Duration) -> Self {
        self.config.check_interval = value.max(Duration::from_secs(1));
        self
    }

    /// Sets the worker pool size (at least 1).
    pub fn max_concurrent_jobs(mut self, value: usize) -> Self {
        self.config.max_concurrent_jobs = value.max(1);
        self
    }

    pub fn job_timeout(mut self, value: Duration) -> Self {
        self.config.job_timeout = value;
        self
    }

    /// Sets the total attempt budget (at least 1).
    pub fn max_retries(mut self, value: u32) -> Self {
        self.config.max_retries = value.max(1);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.config.retry_delay = value;
        self
    }

    pub fn backoff(mut self, value: BackoffStrategy) -> Self {
        self.config.backoff = value;
        self
    }

    pub fn max_retry_delay(mut self, value: Option<Duration>) -> Self {
        self.config.max_retry_delay = value;
        self
    }

    pub fn retry_condition(mut self, value: RetryCondition) -> Self {
        self.config.retry_condition = value;
        self
    }

    pub fn retry_jitter(mut self, value: bool) -> Self {
        self.config.retry_jitter = value;
        self
    }

    pub fn shutdown_grace_period(mut self, value: Duration) -> Self {
        self.config.shutdown_grace_period = value;
        self
    }

    pub fn max_catchup_minutes(mut self, value: u32) -> Self {
        self.config.max_catchup_minutes = value;
        self
    }

    pub fn stale_job_threshold(mut self, value: Option<Duration>) -> Self {
        self.config.stale_job_threshold = value;
        self
    }

    pub fn result_retention(mut self, value: Option<Duration>) -> Self {
        self.config.result_retention = value;
        self
    }

    pub fn write_retries(mut self, value: u32) -> Self {
        self.config.write_retries = value;
        self
    }

    pub fn write_retry_delay(mut self, value: Duration) -> Self {
        self.config.write_retry_delay = value;
        self
    }

    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfigBuilder::default().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();

        assert_eq!(config.check_interval(), Duration::from_secs(60));
        assert_eq!(config.max_concurrent_jobs(), 10);
        assert_eq!(config.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.retry_delay(), Duration::from_secs(60));
        assert_eq!(config.backoff(), &BackoffStrategy::Fixed);
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(30));
        assert_eq!(config.max_catchup_minutes(), 5);
        assert_eq!(config.stale_job_threshold(), Duration::from_secs(7200));
        assert_eq!(config.result_retention(), None);
        assert_eq!(config.write_retries(), 3);
    }

    #[test]
    fn test_builder_clamps_degenerate_values() {
        let config = SchedulerConfig::builder()
            .check_interval(Duration::from_millis(10))
            .max_concurrent_jobs(0)
            .max_retries(0)
            .build();

        assert_eq!(config.check_interval(), Duration::from_secs(1));
        assert_eq!(config.max_concurrent_jobs(), 1);
        assert_eq!(config.max_retries(), 1);
    }

    #[test]
    fn test_executor_config_carries_retry_settings() {
        let config = SchedulerConfig::builder()
            .max_concurrent_jobs(4)
            .job_timeout(Duration::from_secs(600))
            .max_retries(5)
            .retry_delay(Duration::from_secs(2))
            .backoff(BackoffStrategy::Exponential {
                base: 2.0,
                multiplier: 1.0,
            })
            .build();

        let executor = config.executor_config();
        assert_eq!(executor.max_concurrent_jobs, 4);
        assert_eq!(executor.job_timeout, Duration::from_secs(600));
        assert_eq!(executor.retry_policy.max_attempts, 5);
        assert_eq!(executor.retry_policy.initial_delay, Duration::from_secs(2));
        assert_eq!(executor.retry_policy.max_delay, Duration::from_secs(600));
        assert_eq!(executor.retry_policy.calculate_delay(3), Duration::from_secs(8));
    }
}
