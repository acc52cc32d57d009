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

//! Rule store accessor.
//!
//! The [`RuleStore`] is the only component touching persistent state. It
//! loads validated rules, owns the job lifecycle rows and provides the atomic
//! claim that keeps two scheduler ticks (or two scheduler processes) from
//! executing the same scheduled instance.
//!
//! Two implementations are provided:
//!
//! - [`DieselRuleStore`] over PostgreSQL or SQLite
//! - [`MemoryRuleStore`] for tests and embedding

pub mod diesel_store;
pub mod memory;
mod rows;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::models::{JobExecution, JobId, JobStatus, RuleDefinition};

pub use diesel_store::DieselRuleStore;
pub use memory::MemoryRuleStore;

/// Message recorded on jobs swept by [`RuleStore::recover_stale`].
pub const ABANDONED_MESSAGE: &str = "abandoned: no progress recorded before scheduler restart";

/// Persistent state behind the scheduler.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Loads every enabled rule that passes validation.
    ///
    /// Malformed rules are logged and skipped. Any failure to read is
    /// reported as [`StoreError::Unavailable`].
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>, StoreError>;

    /// Creates the `pending` row for a job.
    ///
    /// Returns `false` when a row with the same `job_id` already exists; the
    /// existing row is left untouched.
    async fn enqueue(&self, job: &JobExecution) -> Result<bool, StoreError>;

    /// Atomically moves a job from `pending` to `running`.
    ///
    /// Returns `false` if the job is missing or is not `pending`, i.e. some
    /// other worker already claimed it.
    async fn mark_claimed(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically moves a job from `pending` straight to `failed`.
    ///
    /// Used for jobs cancelled before any worker claimed them. Returns
    /// `false` if the job is missing or is no longer `pending`.
    async fn fail_pending(
        &self,
        job_id: &JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Writes the current state of a job, creating the row if needed.
    async fn record_execution(&self, job: &JobExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, job_id: &JobId) -> Result<Option<JobExecution>, StoreError>;

    /// Marks non-terminal jobs last updated before `older_than` as `failed`.
    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Deletes terminal jobs last updated before `older_than`.
    async fn prune_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of jobs in each status.
    async fn status_counts(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError>;
}

const NON_TERMINAL: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Running, JobStatus::Retrying];
const TERMINAL: [JobStatus; 3] = [JobStatus::Succeeded, JobStatus::Failed, JobStatus::TimedOut];
