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

//! The scheduler loop.
//!
//! Each tick loads the rule set, asks the [`TriggerEngine`] which rules are
//! due for every minute since the previous tick, and hands the due rules to
//! the [`ExecutionEngine`]. Job futures are spawned onto a join set owned by
//! the loop, so a tick only waits for submission and never for the jobs
//! themselves; completed jobs are reaped between ticks.
//!
//! ```rust,ignore
//! let scheduler = Scheduler::new(SchedulerConfig::default(), catalog, store, backend);
//! let handle = scheduler.start().await;
//! // ...
//! let report = handle.shutdown().await;
//! ```

mod config;

pub use config::{SchedulerConfig, SchedulerConfigBuilder};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::error::SchedulerError;
use crate::executor::{ExecutionEngine, JobReport, JobRequest, QueryBackend};
use crate::models::JobId;
use crate::store::RuleStore;
use crate::trigger::{minutes_to_evaluate, TriggerEngine};

/// How often finished jobs past their retention are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    /// Minutes evaluated, oldest first.
    pub evaluated: Vec<DateTime<Utc>>,
    pub rules_loaded: usize,
    pub submitted: usize,
    /// Rules skipped because their schedule could not be resolved.
    pub rejected: usize,
}

/// Outcome of [`SchedulerHandle::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Reports of jobs that ended within the grace period.
    pub completed: Vec<JobReport>,
    /// Jobs that had to be aborted and were recorded as failed.
    pub aborted: Vec<JobId>,
}

#[derive(Debug, Default)]
struct TickState {
    last_evaluated: Option<DateTime<Utc>>,
    last_fired: HashMap<String, DateTime<Utc>>,
    // Fired instants whose pending row was never written.
    unsubmitted: Vec<(String, DateTime<Utc>)>,
}

/// Periodically schedules due rules onto the execution engine.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn RuleStore>,
    trigger: TriggerEngine,
    engine: ExecutionEngine,
    state: Mutex<TickState>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        catalog: Arc<Catalog>,
        store: Arc<dyn RuleStore>,
        backend: Arc<dyn QueryBackend>,
    ) -> Self {
        let engine = ExecutionEngine::new(
            config.executor_config(),
            catalog.clone(),
            store.clone(),
            backend,
        );
        Self {
            config,
            store,
            trigger: TriggerEngine::new(catalog),
            engine,
            state: Mutex::new(TickState::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Loads the rules and works out the job requests due at `now`.
    ///
    /// A store read failure aborts the tick without touching the trigger
    /// state, so the same minutes are evaluated again on the next tick.
    async fn plan(&self, now: DateTime<Utc>) -> Result<(TickSummary, Vec<JobRequest>), SchedulerError> {
        let rules = match self.store.load_rules().await {
            Ok(rules) => rules,
            Err(error) => {
                warn!(%error, "rule store unavailable, skipping tick");
                return Err(error.into());
            }
        };

        let mut state = self.state.lock();
        let minutes = minutes_to_evaluate(state.last_evaluated, now, self.config.max_catchup_minutes());

        let mut summary = TickSummary {
            rules_loaded: rules.len(),
            ..TickSummary::default()
        };
        let mut requests = Vec::new();

        for (rule_id, scheduled_for) in std::mem::take(&mut state.unsubmitted) {
            match rules.iter().find(|r| r.rule_id == rule_id) {
                Some(rule) => {
                    debug!(%rule_id, %scheduled_for, "resubmitting job that was never enqueued");
                    requests.push(JobRequest::new(rule.clone(), scheduled_for));
                }
                None => debug!(%rule_id, %scheduled_for, "dropping unsubmitted job for unloaded rule"),
            }
        }

        for &minute in &minutes {
            let due = self.trigger.due_rules(minute, &rules, &state.last_fired);
            for (rule_id, error) in &due.rejected {
                warn!(%rule_id, %error, "rule skipped");
                counter!("kpiflow_rules_rejected_total").increment(1);
            }
            summary.rejected += due.rejected.len();

            for rule in rules.iter().filter(|r| due.due.contains(&r.rule_id)) {
                state.last_fired.insert(rule.rule_id.clone(), minute);
                requests.push(JobRequest::new(rule.clone(), minute));
            }
        }

        if let Some(&last) = minutes.last() {
            state.last_evaluated = Some(last);
        }
        state
            .last_fired
            .retain(|rule_id, _| rules.iter().any(|r| &r.rule_id == rule_id));

        summary.evaluated = minutes;
        summary.submitted = requests.len();
        counter!("kpiflow_ticks_total").increment(1);
        debug!(
            rules = summary.rules_loaded,
            minutes = summary.evaluated.len(),
            due = summary.submitted,
            "tick planned"
        );
        Ok((summary, requests))
    }

    /// Runs one tick, spawning due jobs onto `jobs` without awaiting them.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        jobs: &mut JoinSet<JobReport>,
    ) -> Result<TickSummary, SchedulerError> {
        let (summary, requests) = self.plan(now).await?;
        for request in requests {
            jobs.spawn(self.engine.run(request));
        }
        Ok(summary)
    }

    /// Runs one tick at `now` and waits for every job it submitted.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<JobReport>, SchedulerError> {
        let (summary, requests) = self.plan(now).await?;
        let reports = self.engine.execute(requests).await;
        for report in &reports {
            self.requeue(report);
        }
        info!(
            due = summary.submitted,
            rejected = summary.rejected,
            finished = reports.iter().filter(|r| r.execution().is_some()).count(),
            "tick completed"
        );
        Ok(reports)
    }

    /// Remembers an instant whose job never reached the store so the next
    /// tick submits it again.
    fn requeue(&self, report: &JobReport) {
        if let JobReport::EnqueueFailed {
            rule_id,
            scheduled_for,
            ..
        } = report
        {
            let mut state = self.state.lock();
            let entry = (rule_id.clone(), *scheduled_for);
            if !state.unsubmitted.contains(&entry) {
                state.unsubmitted.push(entry);
            }
        }
    }

    /// Marks jobs left non-terminal by a dead worker as failed.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, SchedulerError> {
        let threshold = chrono::Duration::from_std(self.config.stale_job_threshold())
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let recovered = self.store.recover_stale(now - threshold, now).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered abandoned jobs");
        }
        Ok(recovered)
    }

    /// Deletes terminal jobs older than the retention window, if one is set.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let Some(retention) = self.config.result_retention() else {
            return Ok(0);
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Ok(0);
        };
        let pruned = self.store.prune_finished(now - retention).await?;
        if pruned > 0 {
            info!(pruned, "pruned finished jobs");
        }
        Ok(pruned)
    }

    /// Recovers stale jobs and starts the tick loop in the background.
    pub async fn start(self) -> SchedulerHandle {
        let scheduler = Arc::new(self);

        if let Err(error) = scheduler.recover(Utc::now()).await {
            warn!(%error, "stale job recovery failed at startup");
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let loop_handle = tokio::spawn(scheduler.clone().run_loop(shutdown_rx));

        info!(
            check_interval_secs = scheduler.config.check_interval().as_secs(),
            max_concurrent_jobs = scheduler.config.max_concurrent_jobs(),
            worker_id = %scheduler.engine.worker_id(),
            "scheduler started"
        );

        SchedulerHandle {
            scheduler,
            shutdown_tx,
            loop_handle,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinSet<JobReport> {
        let mut jobs = JoinSet::new();

        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pruner = tokio::time::interval(PRUNE_INTERVAL);
        pruner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let prune_enabled = self.config.result_retention().is_some();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(error) = self.tick(Utc::now(), &mut jobs).await {
                        debug!(%error, "tick skipped");
                    }
                    self.engine.flush_abandoned().await;
                }
                _ = pruner.tick(), if prune_enabled => {
                    if let Err(error) = self.prune(Utc::now()).await {
                        warn!(%error, "pruning finished jobs failed");
                    }
                }
                Some(joined) = jobs.join_next() => {
                    if let Some(report) = reap(joined) {
                        self.requeue(&report);
                    }
                }
            }
        }

        jobs
    }
}

fn reap(joined: Result<JobReport, JoinError>) -> Option<JobReport> {
    match joined {
        Ok(report) => {
            if let JobReport::Finished {
                execution,
                persisted: false,
            } = &report
            {
                error!(job_id = %execution.job_id, "job outcome could not be stored");
            }
            Some(report)
        }
        Err(error) => {
            error!(%error, "job task did not complete");
            None
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    scheduler: Arc<Scheduler>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: JoinHandle<JoinSet<JobReport>>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stops ticking, cancels in-flight jobs and waits up to the grace
    /// period for them to record their outcome. Jobs still running after
    /// that are aborted and recorded as failed.
    pub async fn shutdown(self) -> ShutdownReport {
        let _ = self.shutdown_tx.send(());

        let mut jobs = match self.loop_handle.await {
            Ok(jobs) => jobs,
            Err(error) => {
                error!(%error, "scheduler loop did not stop cleanly");
                JoinSet::new()
            }
        };

        let engine = self.scheduler.engine();
        info!(in_flight = jobs.len(), "cancelling in-flight jobs");
        engine.cancel();

        let mut report = ShutdownReport::default();
        let grace = self.scheduler.config.shutdown_grace_period();
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = jobs.join_next().await {
                report.completed.extend(reap(joined));
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = jobs.len(), "grace period elapsed, aborting jobs");
            jobs.abort_all();
            while let Some(joined) = jobs.join_next().await {
                report.completed.extend(reap(joined).into_iter());
            }
        }

        report.aborted = engine.flush_abandoned().await;
        info!(
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            "scheduler stopped"
        );
        report
    }
}
