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


//! Rule definitions persisted through the Diesel store.

use diesel::prelude::*;
use kpiflow::models::{CompareOp, FilterValue, MetricNames};
use kpiflow::{FilterPredicate, RuleStore, StoreError};
use serial_test::serial;

use crate::fixtures::{rule, TestFixture};

fn insert_raw_row(fixture: &TestFixture, rule_id: &str, aggregation: &str, filter: Option<&str>) {
    let mut conn = SqliteConnection::establish(fixture.path().to_str().unwrap()).unwrap();
    diesel::sql_query(
        "INSERT INTO rule_definitions \
         (rule_id, table_name, metric_name, aggregation, granularity, schedule_name, filter_predicate, enabled, updated_at) \
         VALUES (?, 'du_metrics', 'cpu_usage', ?, '1-hour', 'EVERYHOUR', ?, 1, '2024-01-01T00:00:00.000000Z')",
    )
    .bind::<diesel::sql_types::Text, _>(rule_id)
    .bind::<diesel::sql_types::Text, _>(aggregation)
    .bind::<diesel::sql_types::Nullable<diesel::sql_types::Text>, _>(filter)
    .execute(&mut conn)
    .unwrap();
}

#[tokio::test]
#[serial]
async fn test_saved_rules_load_back_validated() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    let mut threshold = rule("t1", "EVERY5MINUTES");
    threshold.metric_name = MetricNames::Many(vec!["cpu_usage".into(), "mem_usage".into()]);
    threshold.filter_predicate = Some(FilterPredicate::compare(
        "region",
        CompareOp::Eq,
        Some(FilterValue::Text("us-east".into())),
    ));
    threshold.upper_limit = Some(90.0);

    let mut disabled = rule("d1", "EVERYHOUR");
    disabled.enabled = false;

    let saved = store
        .save_rules(&[rule("r1", "EVERYHOUR"), threshold.clone(), disabled])
        .await
        .unwrap();
    assert_eq!(saved, 3);

    let rules = store.load_rules().await.unwrap();
    let ids: Vec<_> = rules.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["r1", "t1"]);

    let loaded = &rules[1];
    assert_eq!(loaded.metric_names, vec!["cpu_usage", "mem_usage"]);
    assert_eq!(loaded.filter_predicate, threshold.filter_predicate);
    assert_eq!(loaded.upper_limit, Some(90.0));
    assert!(loaded.is_threshold());
}

#[tokio::test]
#[serial]
async fn test_save_rules_upserts_by_rule_id() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    store.save_rules(&[rule("r1", "EVERYHOUR")]).await.unwrap();
    let mut changed = rule("r1", "EVERYDAY");
    changed.aggregation = "max".into();
    store.save_rules(&[changed]).await.unwrap();

    let rules = store.load_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].schedule_name, "EVERYDAY");
    assert_eq!(rules[0].aggregation.as_str(), "max");
}

#[tokio::test]
#[serial]
async fn test_invalid_batch_is_rejected_whole() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    let mut bad = rule("bad", "EVERYHOUR");
    bad.granularity = "90-minute".into();

    let error = store
        .save_rules(&[rule("good", "EVERYHOUR"), bad])
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::WriteFailed { .. }));
    assert!(store.load_rules().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_invalid_and_corrupt_rows_are_skipped() {
    let fixture = TestFixture::new().await;
    let store = fixture.store();

    store.save_rules(&[rule("good", "EVERYHOUR")]).await.unwrap();
    insert_raw_row(&fixture, "unsupported", "mode", None);
    insert_raw_row(&fixture, "corrupt", "avg", Some("{not json"));

    let rules = store.load_rules().await.unwrap();
    let ids: Vec<_> = rules.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["good"]);
}
