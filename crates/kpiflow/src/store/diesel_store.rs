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

//! [`RuleStore`] over PostgreSQL or SQLite through Diesel.
//!
//! Claiming relies on a single conditional update:
//!
//! ```sql
//! UPDATE job_executions SET status = 'running', ...
//! WHERE job_id = ? AND status = 'pending'
//! ```
//!
//! Exactly one concurrent caller sees an affected row count of one; every
//! other caller gets `false`. No further locking is involved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::rows::{JobRow, RuleRow};
use super::{RuleStore, ABANDONED_MESSAGE, NON_TERMINAL, TERMINAL};
use crate::catalog::Catalog;
use crate::database::schema::{job_executions, rule_definitions};
use crate::database::universal_types::encode_timestamp;
use crate::database::{with_connection, Database};
use crate::error::StoreError;
use crate::models::{JobExecution, JobId, JobStatus, RawRuleDefinition, RuleDefinition};

fn status_strings(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Database-backed rule store.
#[derive(Debug, Clone)]
pub struct DieselRuleStore {
    database: Database,
    catalog: Arc<Catalog>,
}

impl DieselRuleStore {
    pub fn new(database: Database, catalog: Arc<Catalog>) -> Self {
        Self { database, catalog }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Inserts or replaces rule definitions, keyed by `rule_id`.
    ///
    /// Records are validated first; the whole batch is rejected if any
    /// record is invalid.
    pub async fn save_rules(&self, records: &[RawRuleDefinition]) -> Result<usize, StoreError> {
        for record in records {
            self.catalog
                .validate_rule(record)
                .map_err(|e| StoreError::WriteFailed {
                    job_id: record.rule_id.clone(),
                    reason: e.to_string(),
                })?;
        }
        let now = Utc::now();
        let rows = records
            .iter()
            .map(|r| RuleRow::from_raw(r, now))
            .collect::<Result<Vec<_>, _>>()?;

        let saved = with_connection!(self.database, |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let mut saved = 0;
                for row in &rows {
                    saved += diesel::insert_into(rule_definitions::table)
                        .values(row)
                        .on_conflict(rule_definitions::rule_id)
                        .do_update()
                        .set((
                            rule_definitions::table_name.eq(excluded(rule_definitions::table_name)),
                            rule_definitions::metric_name.eq(excluded(rule_definitions::metric_name)),
                            rule_definitions::aggregation.eq(excluded(rule_definitions::aggregation)),
                            rule_definitions::granularity.eq(excluded(rule_definitions::granularity)),
                            rule_definitions::schedule_name
                                .eq(excluded(rule_definitions::schedule_name)),
                            rule_definitions::filter_predicate
                                .eq(excluded(rule_definitions::filter_predicate)),
                            rule_definitions::entity_column
                                .eq(excluded(rule_definitions::entity_column)),
                            rule_definitions::timestamp_column
                                .eq(excluded(rule_definitions::timestamp_column)),
                            rule_definitions::lower_limit.eq(excluded(rule_definitions::lower_limit)),
                            rule_definitions::upper_limit.eq(excluded(rule_definitions::upper_limit)),
                            rule_definitions::enabled.eq(excluded(rule_definitions::enabled)),
                            rule_definitions::updated_at.eq(excluded(rule_definitions::updated_at)),
                        ))
                        .execute(conn)?;
                }
                Ok(saved)
            })
        })?;

        info!(count = saved, "Saved rule definitions");
        Ok(saved)
    }

    /// Most recently updated executions, optionally filtered by status.
    pub async fn list_executions(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<JobExecution>, StoreError> {
        let status = status.map(|s| s.as_str().to_string());
        let rows: Vec<JobRow> = with_connection!(self.database, |conn| {
            let mut query = job_executions::table
                .select(JobRow::as_select())
                .order(job_executions::updated_at.desc())
                .limit(limit)
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(job_executions::status.eq(status));
            }
            query.load::<JobRow>(conn)
        })?;
        rows.into_iter().map(JobRow::into_execution).collect()
    }
}

#[async_trait]
impl RuleStore for DieselRuleStore {
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>, StoreError> {
        let load = async {
            let rows: Vec<RuleRow> = with_connection!(self.database, |conn| {
                rule_definitions::table
                    .filter(rule_definitions::enabled.eq(true))
                    .order(rule_definitions::rule_id.asc())
                    .select(RuleRow::as_select())
                    .load::<RuleRow>(conn)
            })?;
            Ok::<_, StoreError>(rows)
        };
        let rows = load
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let rule_id = row.rule_id.clone();
            match row.into_raw() {
                Ok(record) => records.push(record),
                Err(error) => warn!(%rule_id, %error, "Skipping undecodable rule row"),
            }
        }
        let validated = self.catalog.validate_rules(records.iter());
        debug!(
            loaded = validated.rules.len(),
            rejected = validated.rejected.len(),
            "Loaded rule definitions"
        );
        Ok(validated.rules)
    }

    async fn enqueue(&self, job: &JobExecution) -> Result<bool, StoreError> {
        let row = JobRow::from_execution(job, Utc::now());
        let inserted = with_connection!(self.database, |conn| {
            diesel::insert_into(job_executions::table)
                .values(&row)
                .on_conflict(job_executions::job_id)
                .do_nothing()
                .execute(conn)
        })?;
        Ok(inserted == 1)
    }

    async fn mark_claimed(
        &self,
        job_id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = job_id.to_string();
        let worker = worker_id.to_string();
        let ts = encode_timestamp(now);
        let updated = with_connection!(self.database, |conn| {
            diesel::update(
                job_executions::table
                    .filter(job_executions::job_id.eq(&id))
                    .filter(job_executions::status.eq(JobStatus::Pending.as_str())),
            )
            .set((
                job_executions::status.eq(JobStatus::Running.as_str()),
                job_executions::worker_id.eq(Some(worker)),
                job_executions::started_at.eq(Some(ts.clone())),
                job_executions::updated_at.eq(ts),
            ))
            .execute(conn)
        })?;
        Ok(updated == 1)
    }

    async fn fail_pending(
        &self,
        job_id: &JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = job_id.to_string();
        let message = message.to_string();
        let ts = encode_timestamp(now);
        let updated = with_connection!(self.database, |conn| {
            diesel::update(
                job_executions::table
                    .filter(job_executions::job_id.eq(&id))
                    .filter(job_executions::status.eq(JobStatus::Pending.as_str())),
            )
            .set((
                job_executions::status.eq(JobStatus::Failed.as_str()),
                job_executions::error_message.eq(Some(message)),
                job_executions::finished_at.eq(Some(ts.clone())),
                job_executions::updated_at.eq(ts),
            ))
            .execute(conn)
        })?;
        Ok(updated == 1)
    }

    async fn record_execution(&self, job: &JobExecution) -> Result<(), StoreError> {
        let job_id = job.job_id.to_string();
        let row = JobRow::from_execution(job, Utc::now());
        let result = async {
            with_connection!(self.database, |conn| {
                diesel::insert_into(job_executions::table)
                    .values(&row)
                    .on_conflict(job_executions::job_id)
                    .do_update()
                    .set((
                        job_executions::status.eq(excluded(job_executions::status)),
                        job_executions::attempt_count.eq(excluded(job_executions::attempt_count)),
                        job_executions::generated_sql_query
                            .eq(excluded(job_executions::generated_sql_query)),
                        job_executions::record_count.eq(excluded(job_executions::record_count)),
                        job_executions::error_message.eq(excluded(job_executions::error_message)),
                        job_executions::worker_id.eq(excluded(job_executions::worker_id)),
                        job_executions::started_at.eq(excluded(job_executions::started_at)),
                        job_executions::finished_at.eq(excluded(job_executions::finished_at)),
                        job_executions::updated_at.eq(excluded(job_executions::updated_at)),
                    ))
                    .execute(conn)
            })?;
            Ok::<_, StoreError>(())
        };
        result.await.map_err(|e| StoreError::WriteFailed {
            job_id,
            reason: e.to_string(),
        })
    }

    async fn get_execution(&self, job_id: &JobId) -> Result<Option<JobExecution>, StoreError> {
        let id = job_id.to_string();
        let row: Option<JobRow> = with_connection!(self.database, |conn| {
            job_executions::table
                .filter(job_executions::job_id.eq(&id))
                .select(JobRow::as_select())
                .first::<JobRow>(conn)
                .optional()
        })?;
        row.map(JobRow::into_execution).transpose()
    }

    async fn recover_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let cutoff = encode_timestamp(older_than);
        let ts = encode_timestamp(now);
        let live = status_strings(&NON_TERMINAL);
        let ids: Vec<String> = with_connection!(self.database, |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let ids: Vec<String> = job_executions::table
                    .filter(job_executions::status.eq_any(&live))
                    .filter(job_executions::updated_at.lt(&cutoff))
                    .select(job_executions::job_id)
                    .order(job_executions::job_id.asc())
                    .load(conn)?;
                if !ids.is_empty() {
                    diesel::update(
                        job_executions::table
                            .filter(job_executions::job_id.eq_any(&ids))
                            .filter(job_executions::status.eq_any(&live)),
                    )
                    .set((
                        job_executions::status.eq(JobStatus::Failed.as_str()),
                        job_executions::error_message.eq(Some(ABANDONED_MESSAGE.to_string())),
                        job_executions::finished_at.eq(Some(ts.clone())),
                        job_executions::updated_at.eq(ts.clone()),
                    ))
                    .execute(conn)?;
                }
                Ok(ids)
            })
        })?;

        if !ids.is_empty() {
            warn!(count = ids.len(), "Marked abandoned jobs as failed");
        }
        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn prune_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = encode_timestamp(older_than);
        let done = status_strings(&TERMINAL);
        let deleted = with_connection!(self.database, |conn| {
            diesel::delete(
                job_executions::table
                    .filter(job_executions::status.eq_any(&done))
                    .filter(job_executions::updated_at.lt(&cutoff)),
            )
            .execute(conn)
        })?;
        Ok(deleted)
    }

    async fn status_counts(&self) -> Result<BTreeMap<JobStatus, u64>, StoreError> {
        let rows: Vec<(String, i64)> = with_connection!(self.database, |conn| {
            job_executions::table
                .group_by(job_executions::status)
                .select((job_executions::status, diesel::dsl::count_star()))
                .load::<(String, i64)>(conn)
        })?;

        let mut counts = BTreeMap::new();
        for (status, count) in rows {
            let status: JobStatus = status.parse().map_err(|reason| StoreError::Corrupt {
                key: "job_executions.status".to_string(),
                reason,
            })?;
            counts.insert(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}
