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


//! Job record round trips, stale recovery, pruning and status counts.

use chrono::{Duration, Utc};
use diesel::prelude::*;
use kpiflow::{JobExecution, JobStatus, RuleDefinition, RuleStore};
use serial_test::serial;

use crate::fixtures::{at, rule, TestFixture};

fn job_at(fixture: &TestFixture, rule_id: &str, minute: u32) -> JobExecution {
    let rule = RuleDefinition::from_raw(&rule(rule_id, "EVERYMINUTE"), &fixture.catalog()).unwrap();
    JobExecution::pending(&rule, at(9, minute, 0), "SELECT 1".to_string(), at(9, minute, 0))
}

/// Rewinds `updated_at` so age-based operations see the row as old.
fn age_row(fixture: &TestFixture, job_id: &str, updated_at: &str) {
    let mut conn = SqliteConnection::establish(fixture.path().to_str().unwrap()).unwrap();
    diesel::sql_query("UPDATE job_executions SET updated_at = ? WHERE job_id = ?")
        .bind::<diesel::sql_types::Text, _>(updated_at)
        .bind::<diesel::sql_types::Text, _>(job_id)
        .execute(&mut conn)
        .unwrap();
}

#[tokio::test]
#[serial]
async fn test_record_execution_round_trip() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    let mut job = job_at(&fixture, "r1", 0);
    store.enqueue(&job).await.unwrap();
    store.mark_claimed(&job.job_id, "w1", at(9, 0, 1)).await.unwrap();

    job.claim("w1", at(9, 0, 1));
    job.begin_attempt();
    job.schedule_retry("connection reset");
    job.begin_attempt();
    job.succeed(42, at(9, 0, 30));
    store.record_execution(&job).await.unwrap();

    let stored = store.get_execution(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored, job);
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.record_count, Some(42));
    assert_eq!(stored.error_message, None);

    let listed = store
        .list_executions(Some(JobStatus::Succeeded), 10)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
#[serial]
async fn test_recover_stale_fails_abandoned_jobs_only() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    let stale = job_at(&fixture, "stale", 0);
    let fresh = job_at(&fixture, "fresh", 1);
    let mut done = job_at(&fixture, "done", 2);
    for job in [&stale, &fresh, &done] {
        store.enqueue(job).await.unwrap();
        store.mark_claimed(&job.job_id, "w1", Utc::now()).await.unwrap();
    }
    done.claim("w1", Utc::now());
    done.begin_attempt();
    done.succeed(1, Utc::now());
    store.record_execution(&done).await.unwrap();

    age_row(&fixture, stale.job_id.as_str(), "2024-01-01T09:00:00.000000Z");
    age_row(&fixture, done.job_id.as_str(), "2024-01-01T09:00:00.000000Z");

    let now = Utc::now();
    let recovered = store.recover_stale(now - Duration::hours(2), now).await.unwrap();

    assert_eq!(recovered, vec![stale.job_id.clone()]);
    let stored = store.get_execution(&stale.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.finished_at.is_some());
    assert_eq!(
        store.get_execution(&fresh.job_id).await.unwrap().unwrap().status,
        JobStatus::Running
    );
    assert_eq!(
        store.get_execution(&done.job_id).await.unwrap().unwrap().status,
        JobStatus::Succeeded
    );
}

#[tokio::test]
#[serial]
async fn test_prune_and_status_counts() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    let old = job_at(&fixture, "old", 0);
    let mut old_done = old.clone();
    store.enqueue(&old).await.unwrap();
    store.mark_claimed(&old.job_id, "w1", Utc::now()).await.unwrap();
    old_done.claim("w1", Utc::now());
    old_done.begin_attempt();
    old_done.fail("boom", Utc::now());
    store.record_execution(&old_done).await.unwrap();
    age_row(&fixture, old.job_id.as_str(), "2024-01-01T09:00:00.000000Z");

    let pending = job_at(&fixture, "pending", 1);
    store.enqueue(&pending).await.unwrap();
    age_row(&fixture, pending.job_id.as_str(), "2024-01-01T09:00:00.000000Z");

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.get(&JobStatus::Failed), Some(&1));
    assert_eq!(counts.get(&JobStatus::Pending), Some(&1));

    let pruned = store
        .prune_finished(Utc::now() - Duration::days(1))
        .await
        .unwrap();
    assert_eq!(pruned, 1);

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.get(&JobStatus::Failed), None);
    assert_eq!(counts.get(&JobStatus::Pending), Some(&1));
}
