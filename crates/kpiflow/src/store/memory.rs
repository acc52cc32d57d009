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

//! In-memory [`RuleStore`].
//!
//! Semantics match [`DieselRuleStore`](super::DieselRuleStore): claims are
//! atomic under a single mutex. Reads and writes can be made to fail on
//! demand to exercise error paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{RuleStore, ABANDONED_MESSAGE};
use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::models::{JobExecution, JobId, JobStatus, RawRuleDefinition, RuleDefinition};

#[derive(Debug, Clone)]
struct StoredJob {
    job: JobExecution,
    updated_at: DateTime<Utc>,
}

/// A [`RuleStore`] kept entirely in process memory.
#[derive(Debug)]
pub struct MemoryRuleStore {
    catalog: Arc<Catalog>,
    rules: RwLock<Vec<RawRuleDefinition>>,
    jobs: Mutex<HashMap<JobId, StoredJob>>,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
    enqueue_failures: AtomicUsize,
}

impl MemoryRuleStore {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            rules: RwLock::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            reads_fail: AtomicBool::new(false),
            writes_fail: AtomicBool::new(false),
            enqueue_failures: AtomicUsize::new(0),
        }
    }

    /// Adds or replaces rules by `rule_id`.
    pub fn put_rules(&self, records: impl IntoIterator<Item = RawRuleDefinition>) {
        let mut rules = self.rules.write();
        for record in records {
            rules.retain(|r| r.rule_id != record.rule_id);
            rules.push(record);
        }
    }

    /// Makes subsequent `load_rules` calls fail with `Unavailable`.
    pub fn set_reads_fail(&self, fail: bool) {
        self.reads_fail.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `record_execution` calls fail.
    pub fn set_writes_fail(&self, fail: bool) {
        self.writes_fail.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `n` calls to `enqueue` fail.
    pub fn fail_next_enqueues(&self, n: usize) {
        self.enqueue_failures.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every stored job.
    pub fn executions(&self) -> Vec<JobExecution> {
        let mut jobs: Vec<JobExecution> =
            self.jobs.lock().values().map(|s| s.job.clone()).collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|s| s.job.status == status)
            .count()
    }

    /// Overrides the last-update time of a job.
    pub fn touch(&self, job_id: &JobId, updated_at: DateTime<Utc>) {
        if let Some(stored) = self.jobs.lock().get_mut(job_id) {
            stored.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>, StoreError> {
        if self.reads_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store reads disabled".into()));
        }
        let rules = self.rules.read();
        Ok(self.catalog.validate_rules(rules.iter()).rules)
    }

    async fn enqueue(&self, job: &JobExecution) -> Result<bool, StoreError> {
        let injected = self
            .enqueue_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::WriteFailed {
                job_id: job.job_id.to_string(),
                reason: "memory store enqueue disabled".into(),
            });
        }
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.job_id) {
            return Ok(false);
        }
        jobs.insert(
            job.job_id.clone(),
            StoredJob {
                job: job.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn mark_claimed(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(stored) if stored.job.status == JobStatus::Pending => {
                stored.job.claim(worker_id, now);
                stored.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_pending(
        &self,
        job_id: &JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(job_id) {
            Some(stored) if stored.job.status == JobStatus::Pending => {
                stored.job.fail(message, now);
                stored.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_execution(&self, job: &JobExecution) -> Result<(), StoreError> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed {
                job_id: job.job_id.to_string(),
                reason: "memory store writes disabled".into(),
            });
        }
        self.jobs.lock().insert(
            job.job_id.clone(),
            StoredJob {
                job: job.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_execution(&self, job_id: &JobId) -> Result<Option<JobExecution>, StoreError> {
        Ok(self.jobs.lock().get(job_id).map(|s| s.job.clone()))
    }

    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut recovered = Vec::new();
        for stored in self.jobs.lock().values_mut() {
            if !stored.job.status.is_terminal() && stored.updated_at < older_than {
                stored.job.status = JobStatus::Failed;
                stored.job.error_message = Some(ABANDONED_MESSAGE.to_string());
                stored.job.finished_at = Some(now);
                stored.updated_at = now;
                recovered.push(stored.job.job_id.clone());
            }
        }
        recovered.sort();
        Ok(recovered)
    }

    async fn prune_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, s| !(s.job.status.is_terminal() && s.updated_at < older_than));
        Ok(before - jobs.len())
    }

    async fn status_counts(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        let mut counts = BTreeMap::new();
        for stored in self.jobs.lock().values() {
            *counts.entry(stored.job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
