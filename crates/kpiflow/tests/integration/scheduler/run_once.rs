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


//! One-shot scheduler ticks against the SQLite store.

use std::time::Duration;

use kpiflow::{BackendError, JobId, JobStatus, RuleStore, Scheduler, SchedulerConfig};
use serial_test::serial;

use crate::fixtures::{at, rule, ScriptedBackend, TestFixture};

fn config() -> SchedulerConfig {
    SchedulerConfig::builder()
        .max_concurrent_jobs(2)
        .max_retries(3)
        .retry_delay(Duration::from_millis(10))
        .write_retry_delay(Duration::from_millis(10))
        .build()
}

#[tokio::test]
#[serial]
async fn test_due_rules_are_executed_and_recorded() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    store
        .save_rules(&[
            rule("hourly", "EVERYHOUR"),
            rule("every5", "EVERY5MINUTES"),
            rule("daily", "EVERYDAY"),
        ])
        .await
        .unwrap();

    let backend = ScriptedBackend::new(vec![]);
    let scheduler = Scheduler::new(config(), fixture.catalog(), store.clone(), backend.clone());

    let reports = scheduler.run_once(at(9, 0, 0)).await.unwrap();

    let mut ran: Vec<_> = reports.iter().map(|r| r.rule_id().to_string()).collect();
    ran.sort();
    assert_eq!(ran, vec!["every5", "hourly"]);
    assert_eq!(backend.calls(), 2);

    let stored = store
        .get_execution(&JobId::new("hourly", at(9, 0, 0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.record_count, Some(1));
    assert!(stored.generated_query.contains("FROM \"du_metrics\""));
    assert!(stored.generated_query.contains("TIMESTAMPTZ '2024-01-01 08:00:00+00'"));
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_retry_then_success_is_persisted() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    store.save_rules(&[rule("r1", "EVERYHOUR")]).await.unwrap();

    let backend = ScriptedBackend::new(vec![
        Err(BackendError::Transient("connection reset".into())),
        Err(BackendError::Transient("connection reset".into())),
        Ok(7),
    ]);
    let scheduler = Scheduler::new(config(), fixture.catalog(), store.clone(), backend.clone());

    let reports = scheduler.run_once(at(9, 0, 0)).await.unwrap();
    assert_eq!(reports.len(), 1);

    let stored = store
        .get_execution(&JobId::new("r1", at(9, 0, 0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.attempt_count, 3);
    assert_eq!(stored.record_count, Some(7));
}

#[tokio::test]
#[serial]
async fn test_second_scheduler_does_not_rerun_claimed_job() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    store.save_rules(&[rule("r1", "EVERYHOUR")]).await.unwrap();

    let first_backend = ScriptedBackend::new(vec![]);
    let second_backend = ScriptedBackend::new(vec![]);
    let first = Scheduler::new(config(), fixture.catalog(), store.clone(), first_backend.clone());
    let second = Scheduler::new(config(), fixture.catalog(), store.clone(), second_backend.clone());

    first.run_once(at(9, 0, 0)).await.unwrap();
    let reports = second.run_once(at(9, 0, 20)).await.unwrap();

    assert_eq!(first_backend.calls(), 1);
    assert_eq!(second_backend.calls(), 0);
    assert!(matches!(
        reports.as_slice(),
        [kpiflow::JobReport::AlreadyClaimed { .. }]
    ));
}
