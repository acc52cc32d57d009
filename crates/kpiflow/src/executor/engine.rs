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

//! Worker pool running due rules as jobs.
//!
//! Every [`JobRequest`] goes through the same lifecycle:
//!
//! 1. the rule is turned into a [`GeneratedQuery`]; generation errors reject
//!    the rule without touching the store,
//! 2. a `pending` record is enqueued under the deterministic [`JobId`],
//! 3. the worker waits for one of `max_concurrent_jobs` slots and claims the
//!    job; a lost claim means another worker owns this `(rule, minute)`,
//! 4. backend attempts run under the retry policy, the whole job bounded by
//!    `job_timeout`,
//! 5. the terminal state is written back, retrying the write before giving
//!    up and reporting it as unpersisted.
//!
//! Cancellation (graceful shutdown) turns running jobs into `failed`; tasks
//! that are aborted outright are recorded through the abandoned queue, see
//! [`ExecutionEngine::flush_abandoned`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backend::QueryBackend;
use super::slot::JobSlot;
use super::ExecutorConfig;
use crate::catalog::Catalog;
use crate::error::{BackendError, DefinitionError, ExecutorError, StoreError};
use crate::models::{ExecutionResult, JobExecution, JobId, JobStatus, RuleDefinition};
use crate::query::{GeneratedQuery, QueryGenerator};
use crate::store::RuleStore;

/// Error message recorded for jobs stopped by shutdown.
pub const CANCELLED_MESSAGE: &str = "cancelled during shutdown";

/// One due rule for one scheduled minute.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub rule: RuleDefinition,
    pub scheduled_for: DateTime<Utc>,
}

impl JobRequest {
    pub fn new(rule: RuleDefinition, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            rule,
            scheduled_for,
        }
    }

    pub fn job_id(&self) -> JobId {
        JobId::new(&self.rule.rule_id, self.scheduled_for)
    }
}

/// What happened to a submitted request.
#[derive(Debug)]
pub enum JobReport {
    /// The job ran to a terminal state. `persisted` is false when the final
    /// write to the store failed after all write retries.
    Finished {
        execution: JobExecution,
        persisted: bool,
    },
    /// Another worker already claimed this `(rule, minute)`.
    AlreadyClaimed { job_id: JobId, rule_id: String },
    /// The query generator refused the rule.
    Rejected {
        rule_id: String,
        error: DefinitionError,
    },
    /// The pending row could not be written after all write retries. The
    /// scheduler offers the same instant again on its next tick.
    EnqueueFailed {
        job_id: JobId,
        rule_id: String,
        scheduled_for: DateTime<Utc>,
        error: StoreError,
    },
    /// The store failed while claiming the job.
    StoreFailed {
        job_id: JobId,
        rule_id: String,
        error: StoreError,
    },
    /// Shutdown began before the job was claimed.
    Cancelled { job_id: JobId, rule_id: String },
    /// The worker task panicked or was aborted.
    Aborted {
        job_id: JobId,
        rule_id: String,
        error: ExecutorError,
    },
}

impl JobReport {
    pub fn rule_id(&self) -> &str {
        match self {
            JobReport::Finished { execution, .. } => &execution.rule_id,
            JobReport::AlreadyClaimed { rule_id, .. }
            | JobReport::Rejected { rule_id, .. }
            | JobReport::EnqueueFailed { rule_id, .. }
            | JobReport::StoreFailed { rule_id, .. }
            | JobReport::Cancelled { rule_id, .. }
            | JobReport::Aborted { rule_id, .. } => rule_id,
        }
    }

    pub fn execution(&self) -> Option<&JobExecution> {
        match self {
            JobReport::Finished { execution, .. } => Some(execution),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.execution().map(|e| e.status)
    }

    /// The externally visible result of a finished job.
    pub fn result(&self) -> Option<ExecutionResult> {
        self.execution().map(ExecutionResult::from)
    }
}

struct EngineInner {
    config: ExecutorConfig,
    generator: QueryGenerator,
    store: Arc<dyn RuleStore>,
    backend: Arc<dyn QueryBackend>,
    semaphore: Arc<Semaphore>,
    worker_id: String,
    cancel_tx: watch::Sender<bool>,
    abandoned_tx: mpsc::UnboundedSender<JobExecution>,
    abandoned_rx: AsyncMutex<mpsc::UnboundedReceiver<JobExecution>>,
}

/// Bounded worker pool executing [`JobRequest`]s.
///
/// Cloning is cheap; clones share the pool, the cancellation signal and the
/// worker identity.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("worker_id", &self.inner.worker_id)
            .field("config", &self.inner.config)
            .finish()
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

impl ExecutionEngine {
    pub fn new(
        config: ExecutorConfig,
        catalog: Arc<Catalog>,
        store: Arc<dyn RuleStore>,
        backend: Arc<dyn QueryBackend>,
    ) -> Self {
        let generator = QueryGenerator::new(catalog, backend.dialect());
        let (cancel_tx, _) = watch::channel(false);
        let (abandoned_tx, abandoned_rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

        Self {
            inner: Arc::new(EngineInner {
                config,
                generator,
                store,
                backend,
                semaphore,
                worker_id: format!("worker-{}", Uuid::new_v4()),
                cancel_tx,
                abandoned_tx,
                abandoned_rx: AsyncMutex::new(abandoned_rx),
            }),
        }
    }

    /// Identity written to claimed jobs.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Worker slots not currently held by a running job.
    pub fn available_slots(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// The job future for `request`, ready to be spawned on any join set.
    pub fn run(&self, request: JobRequest) -> impl Future<Output = JobReport> + Send + 'static {
        let span = info_span!(
            "job",
            rule_id = %request.rule.rule_id,
            job_id = %request.job_id()
        );
        self.inner.clone().run_job(request).instrument(span)
    }

    /// Spawns the job on the current runtime without waiting for it.
    pub fn submit(&self, request: JobRequest) -> JoinHandle<JobReport> {
        tokio::spawn(self.run(request))
    }

    /// Runs every request concurrently and returns one report per request,
    /// in request order.
    pub async fn execute(&self, requests: Vec<JobRequest>) -> Vec<JobReport> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let ids = (request.job_id(), request.rule.rule_id.clone());
                (ids, self.submit(request))
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for ((job_id, rule_id), handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(%job_id, error = %e, "job task did not complete");
                    JobReport::Aborted {
                        job_id,
                        rule_id,
                        error: ExecutorError::Join(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        self.flush_abandoned().await;
        reports
    }

    /// Signals every job, running or waiting for a slot, to stop.
    pub fn cancel(&self) {
        self.inner.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel_tx.borrow()
    }

    /// Persists jobs whose worker task ended without finishing them.
    ///
    /// Returns the ids that were recorded as failed.
    pub async fn flush_abandoned(&self) -> Vec<JobId> {
        let mut rx = self.inner.abandoned_rx.lock().await;
        let mut flushed = Vec::new();
        while let Ok(job) = rx.try_recv() {
            warn!(job_id = %job.job_id, rule_id = %job.rule_id, "recording abandoned job as failed");
            self.inner.persist_final(&job).await;
            counter!("kpiflow_jobs_total", "status" => job.status.as_str()).increment(1);
            flushed.push(job.job_id);
        }
        flushed
    }
}

impl EngineInner {
    async fn run_job(self: Arc<Self>, request: JobRequest) -> JobReport {
        let JobRequest {
            rule,
            scheduled_for,
        } = request;
        let job_id = JobId::new(&rule.rule_id, scheduled_for);

        let query = match self.generator.generate(&rule, scheduled_for) {
            Ok(query) => query,
            Err(error) => {
                warn!(%error, "rule rejected by query generator");
                counter!("kpiflow_rules_rejected_total").increment(1);
                return JobReport::Rejected {
                    rule_id: rule.rule_id,
                    error,
                };
            }
        };

        let pending = JobExecution::pending(
            &rule,
            scheduled_for,
            query.inline().to_string(),
            Utc::now(),
        );
        let created = match self.enqueue(&pending).await {
            Ok(created) => created,
            Err(error) => {
                return JobReport::EnqueueFailed {
                    job_id,
                    rule_id: rule.rule_id,
                    scheduled_for,
                    error,
                };
            }
        };
        if !created {
            debug!("job already recorded, attempting to claim");
        }

        let mut slot = JobSlot::new(pending, created, self.abandoned_tx.clone());
        let mut cancel = self.cancel_tx.subscribe();

        let permit = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(error = %ExecutorError::PoolClosed, "no worker slot available");
                    None
                }
            },
        };
        let Some(permit) = permit else {
            return self.cancel_unstarted(slot, job_id, rule.rule_id).await;
        };
        slot.hold(permit);

        let claimed_at = Utc::now();
        match self
            .store
            .mark_claimed(&job_id, &self.worker_id, claimed_at)
            .await
        {
            Ok(true) => {
                slot.job_mut().claim(&self.worker_id, claimed_at);
                slot.arm();
            }
            Ok(false) => {
                debug!("job claimed by another worker");
                let _ = slot.finish();
                return JobReport::AlreadyClaimed {
                    job_id,
                    rule_id: rule.rule_id,
                };
            }
            Err(error) => {
                // Left pending; stale recovery resolves the row.
                warn!(%error, "failed to claim job");
                let _ = slot.finish();
                return JobReport::StoreFailed {
                    job_id,
                    rule_id: rule.rule_id,
                    error,
                };
            }
        }

        debug!(worker_id = %self.worker_id, "job claimed");
        let started = Instant::now();
        let deadline = started + self.config.job_timeout;

        let interrupt = tokio::select! {
            result = tokio::time::timeout_at(deadline, self.run_attempts(slot.job_mut(), &query, deadline)) => {
                result.err().map(|_| Interrupt::TimedOut)
            }
            _ = cancelled(&mut cancel) => Some(Interrupt::Cancelled),
        };

        if !slot.job().status.is_terminal() {
            let now = Utc::now();
            match interrupt {
                Some(Interrupt::Cancelled) => slot.job_mut().fail(CANCELLED_MESSAGE, now),
                _ => slot.job_mut().time_out(
                    format!(
                        "job exceeded timeout of {}s",
                        self.config.job_timeout.as_secs()
                    ),
                    now,
                ),
            }
        }

        let execution = slot.finish();
        let persisted = self.persist_final(&execution).await;
        drop(slot);

        self.record_outcome(&execution, started.elapsed());
        JobReport::Finished {
            execution,
            persisted,
        }
    }

    async fn run_attempts(&self, job: &mut JobExecution, query: &GeneratedQuery, deadline: Instant) {
        let policy = &self.config.retry_policy;
        loop {
            job.begin_attempt();
            let budget = deadline.saturating_duration_since(Instant::now());

            match self.backend.execute(query, budget).await {
                Ok(record_count) => {
                    job.succeed(record_count, Utc::now());
                    return;
                }
                Err(BackendError::Timeout(message)) => {
                    job.time_out(message, Utc::now());
                    return;
                }
                Err(error) if policy.should_retry(&error, job.attempt_count) => {
                    let delay = policy.calculate_delay(job.attempt_count);
                    warn!(
                        attempt = job.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "attempt failed, retrying"
                    );
                    job.schedule_retry(&error);
                    self.persist_progress(job).await;
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    job.fail(&error, Utc::now());
                    return;
                }
            }
        }
    }

    // The row goes pending -> failed without a claim, so a job waiting for
    // a slot never shows up as running.
    async fn cancel_unstarted(&self, mut slot: JobSlot, job_id: JobId, rule_id: String) -> JobReport {
        let now = Utc::now();
        match self.store.fail_pending(&job_id, CANCELLED_MESSAGE, now).await {
            Ok(true) => {
                slot.job_mut().fail(CANCELLED_MESSAGE, now);
                let execution = slot.finish();
                self.record_outcome(&execution, Duration::ZERO);
                JobReport::Finished {
                    execution,
                    persisted: true,
                }
            }
            Ok(false) => {
                let _ = slot.finish();
                JobReport::Cancelled { job_id, rule_id }
            }
            Err(error) => {
                warn!(target: "kpiflow::store", %error, "failed to record cancellation");
                let _ = slot.finish();
                JobReport::Cancelled { job_id, rule_id }
            }
        }
    }

    async fn enqueue(&self, job: &JobExecution) -> Result<bool, StoreError> {
        let attempts = self.config.write_retries + 1;
        let mut attempt = 1;
        loop {
            match self.store.enqueue(job).await {
                Ok(created) => return Ok(created),
                Err(error) if attempt < attempts => {
                    warn!(target: "kpiflow::store", attempt, %error, "enqueue failed, retrying");
                    tokio::time::sleep(self.config.write_retry_delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(
                        target: "kpiflow::store",
                        job_id = %job.job_id,
                        rule_id = %job.rule_id,
                        %error,
                        "failed to enqueue job"
                    );
                    counter!("kpiflow_store_write_failures_total").increment(1);
                    return Err(error);
                }
            }
        }
    }

    // Intermediate states are best effort; the final write is what counts.
    async fn persist_progress(&self, job: &JobExecution) {
        if let Err(error) = self.store.record_execution(job).await {
            warn!(target: "kpiflow::store", %error, status = %job.status, "failed to record job progress");
        }
    }

    async fn persist_final(&self, job: &JobExecution) -> bool {
        let attempts = self.config.write_retries + 1;
        for attempt in 1..=attempts {
            match self.store.record_execution(job).await {
                Ok(()) => return true,
                Err(error) if attempt < attempts => {
                    warn!(target: "kpiflow::store", attempt, %error, "job write failed, retrying");
                    tokio::time::sleep(self.config.write_retry_delay).await;
                }
                Err(error) => {
                    error!(
                        target: "kpiflow::store",
                        job_id = %job.job_id,
                        rule_id = %job.rule_id,
                        status = %job.status,
                        record_count = ?job.record_count,
                        %error,
                        "failed to persist job outcome"
                    );
                    counter!("kpiflow_store_write_failures_total").increment(1);
                }
            }
        }
        false
    }

    fn record_outcome(&self, job: &JobExecution, elapsed: Duration) {
        counter!("kpiflow_jobs_total", "status" => job.status.as_str()).increment(1);
        histogram!("kpiflow_job_duration_seconds").record(elapsed.as_secs_f64());

        let result = ExecutionResult::from(job);
        match result.status {
            JobStatus::Succeeded => info!(
                table_name = %result.table_name,
                metric_name = %result.metric_name,
                record_count = ?result.record_count,
                attempts = job.attempt_count,
                "job succeeded"
            ),
            status => warn!(
                table_name = %result.table_name,
                metric_name = %result.metric_name,
                %status,
                attempts = job.attempt_count,
                error = job.error_message.as_deref().unwrap_or(""),
                "job did not succeed"
            ),
        }
    }
}

/// Resolves once cancellation has been requested.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
