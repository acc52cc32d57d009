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


//! Concurrency tests for job claiming.
//!
//! The `job_id` primary key and the conditional `pending -> running` update
//! are the only guard against double execution; these tests hammer both
//! from concurrent workers.

use std::sync::Arc;

use chrono::Utc;
use kpiflow::{JobExecution, JobId, JobStatus, RuleDefinition, RuleStore};
use serial_test::serial;
use tokio::sync::Barrier;

use crate::fixtures::{at, rule, TestFixture};

fn pending_job(fixture: &TestFixture, rule_id: &str) -> JobExecution {
    let rule = RuleDefinition::from_raw(&rule(rule_id, "EVERYHOUR"), &fixture.catalog()).unwrap();
    JobExecution::pending(&rule, at(9, 0, 0), "SELECT 1".to_string(), at(9, 0, 0))
}

#[tokio::test]
#[serial]
async fn test_enqueue_is_idempotent() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    let job = pending_job(&fixture, "r1");

    assert!(store.enqueue(&job).await.unwrap());
    assert!(!store.enqueue(&job).await.unwrap());

    let stored = store.get_execution(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.job_id, JobId::new("r1", at(9, 0, 0)));
}

#[tokio::test]
#[serial]
async fn test_concurrent_claims_have_one_winner() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    let job = pending_job(&fixture, "r1");
    store.enqueue(&job).await.unwrap();

    const NUM_WORKERS: usize = 8;
    let barrier = Arc::new(Barrier::new(NUM_WORKERS));
    let mut handles = Vec::new();

    for worker in 0..NUM_WORKERS {
        let store = store.clone();
        let barrier = barrier.clone();
        let job_id = job.job_id.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            store
                .mark_claimed(&job_id, &format!("worker-{}", worker), Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one worker must win the claim");

    let stored = store.get_execution(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert!(stored.worker_id.unwrap().starts_with("worker-"));
    assert!(stored.started_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_claim_requires_pending_row() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    let mut job = pending_job(&fixture, "r1");

    assert!(!store.mark_claimed(&job.job_id, "w1", Utc::now()).await.unwrap());

    store.enqueue(&job).await.unwrap();
    assert!(store.mark_claimed(&job.job_id, "w1", Utc::now()).await.unwrap());

    job.claim("w1", Utc::now());
    job.begin_attempt();
    job.succeed(10, Utc::now());
    store.record_execution(&job).await.unwrap();

    assert!(!store.mark_claimed(&job.job_id, "w2", Utc::now()).await.unwrap());
}

#[tokio::test]
#[serial]
async fn test_fail_pending_only_touches_unclaimed_rows() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();
    let waiting = pending_job(&fixture, "r1");
    let claimed = pending_job(&fixture, "r2");
    store.enqueue(&waiting).await.unwrap();
    store.enqueue(&claimed).await.unwrap();
    store.mark_claimed(&claimed.job_id, "w1", Utc::now()).await.unwrap();

    assert!(store.fail_pending(&waiting.job_id, "cancelled", Utc::now()).await.unwrap());
    assert!(!store.fail_pending(&claimed.job_id, "cancelled", Utc::now()).await.unwrap());

    let stored = store.get_execution(&waiting.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("cancelled"));
    assert!(stored.worker_id.is_none());
    assert!(stored.finished_at.is_some());

    let stored = store.get_execution(&claimed.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Running);
}
