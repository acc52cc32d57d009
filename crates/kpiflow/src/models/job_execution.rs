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

//! Job executions: one run of one rule at one scheduled instant.
//!
//! A [`JobExecution`] moves through an explicit state machine:
//!
//! ```text
//! pending -> running -> succeeded
//!               |   \-> timed_out
//!               |   \-> failed
//!               v
//!           retrying -> running ...
//! ```
//!
//! `pending -> failed` is also legal for jobs cancelled before they start or
//! abandoned by a crashed scheduler. Transitions are driven by explicit
//! method calls from the execution engine, never by unwinding.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::rule_definition::RuleDefinition;

/// Unique key of a scheduled rule instance: `<rule_id>@<instant>`.
///
/// The instant is truncated to the minute, so two scheduler ticks in the same
/// minute derive the same id for the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(rule_id: &str, scheduled_for: DateTime<Utc>) -> Self {
        let minute = scheduled_for
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(scheduled_for);
        JobId(format!("{}@{}", rule_id, minute.format("%Y-%m-%dT%H:%MZ")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        JobId(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, TimedOut)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, TimedOut)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// One attempt to run a rule at a specific due instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub job_id: JobId,
    pub rule_id: String,
    pub table_name: String,
    /// Metric columns, comma separated.
    pub metric_name: String,
    /// The due instant this job covers.
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    /// Backend attempts made so far.
    pub attempt_count: u32,
    /// The generated query with literals inlined.
    pub generated_query: String,
    pub record_count: Option<u64>,
    pub error_message: Option<String>,
    /// Identifier of the engine that claimed the job.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    /// Creates the `pending` record for a due rule.
    pub fn pending(
        rule: &RuleDefinition,
        scheduled_for: DateTime<Utc>,
        generated_query: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: JobId::new(&rule.rule_id, scheduled_for),
            rule_id: rule.rule_id.clone(),
            table_name: rule.table_name.clone(),
            metric_name: rule.metric_label(),
            scheduled_for,
            status: JobStatus::Pending,
            attempt_count: 0,
            generated_query,
            record_count: None,
            error_message: None,
            worker_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: JobStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal job transition {} -> {} for {}",
            self.status,
            next,
            self.job_id
        );
        self.status = next;
    }

    /// `pending -> running`, performed once the store confirmed the claim.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.transition(JobStatus::Running);
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
    }

    /// Starts the next backend attempt.
    pub fn begin_attempt(&mut self) {
        if self.status == JobStatus::Retrying {
            self.transition(JobStatus::Running);
        }
        self.attempt_count += 1;
    }

    pub fn succeed(&mut self, record_count: u64, now: DateTime<Utc>) {
        self.transition(JobStatus::Succeeded);
        self.record_count = Some(record_count);
        self.error_message = None;
        self.finished_at = Some(now);
    }

    /// Records a retryable failure; the job stays claimed.
    pub fn schedule_retry(&mut self, error: impl fmt::Display) {
        self.transition(JobStatus::Retrying);
        self.error_message = Some(error.to_string());
    }

    pub fn fail(&mut self, error: impl fmt::Display, now: DateTime<Utc>) {
        self.transition(JobStatus::Failed);
        self.error_message = Some(error.to_string());
        self.finished_at = Some(now);
    }

    pub fn time_out(&mut self, message: impl fmt::Display, now: DateTime<Utc>) {
        self.transition(JobStatus::TimedOut);
        self.error_message = Some(message.to_string());
        self.finished_at = Some(now);
    }
}

/// Terminal report of a job, surfaced for logging and metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub rule_id: String,
    pub table_name: String,
    pub metric_name: String,
    pub generated_sql_query: String,
    pub record_count: Option<u64>,
    pub status: JobStatus,
}

impl From<&JobExecution> for ExecutionResult {
    fn from(job: &JobExecution) -> Self {
        Self {
            rule_id: job.rule_id.clone(),
            table_name: job.table_name.clone(),
            metric_name: job.metric_name.clone(),
            generated_sql_query: job.generated_query.clone(),
            record_count: job.record_count,
            status: job.status,
        }
    }
}
