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

//! Row types for the Diesel store.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::database::schema::{job_executions, rule_definitions};
use crate::database::universal_types::{decode_optional, decode_timestamp, encode_timestamp};
use crate::error::StoreError;
use crate::models::{JobExecution, JobId, MetricNames, RawRuleDefinition};

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = rule_definitions)]
pub(crate) struct RuleRow {
    pub rule_id: String,
    pub table_name: String,
    /// Comma separated metric columns.
    pub metric_name: String,
    pub aggregation: String,
    pub granularity: String,
    pub schedule_name: String,
    /// JSON encoded filter predicate.
    pub filter_predicate: Option<String>,
    pub entity_column: Option<String>,
    pub timestamp_column: Option<String>,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    pub enabled: bool,
    pub updated_at: String,
}

impl RuleRow {
    pub fn from_raw(raw: &RawRuleDefinition, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let filter_predicate = raw
            .filter_predicate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                key: raw.rule_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            rule_id: raw.rule_id.clone(),
            table_name: raw.table_name.clone(),
            metric_name: raw.metric_name.to_vec().join(","),
            aggregation: raw.aggregation.clone(),
            granularity: raw.granularity.clone(),
            schedule_name: raw.schedule_name.clone(),
            filter_predicate,
            entity_column: raw.entity_column.clone(),
            timestamp_column: raw.timestamp_column.clone(),
            lower_limit: raw.lower_limit,
            upper_limit: raw.upper_limit,
            enabled: raw.enabled,
            updated_at: encode_timestamp(now),
        })
    }

    pub fn into_raw(self) -> Result<RawRuleDefinition, StoreError> {
        let filter_predicate = self
            .filter_predicate
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                key: self.rule_id.clone(),
                reason: format!("filter_predicate: {}", e),
            })?;
        Ok(RawRuleDefinition {
            rule_id: self.rule_id,
            table_name: self.table_name,
            metric_name: MetricNames::One(self.metric_name),
            aggregation: self.aggregation,
            granularity: self.granularity,
            schedule_name: self.schedule_name,
            filter_predicate,
            entity_column: self.entity_column,
            timestamp_column: self.timestamp_column,
            lower_limit: self.lower_limit,
            upper_limit: self.upper_limit,
            enabled: self.enabled,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = job_executions)]
pub(crate) struct JobRow {
    pub job_id: String,
    pub rule_id: String,
    pub table_name: String,
    pub metric_name: String,
    pub scheduled_for: String,
    pub status: String,
    pub attempt_count: i32,
    pub generated_sql_query: String,
    pub record_count: Option<i64>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    pub fn from_execution(job: &JobExecution, updated_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id.to_string(),
            rule_id: job.rule_id.clone(),
            table_name: job.table_name.clone(),
            metric_name: job.metric_name.clone(),
            scheduled_for: encode_timestamp(job.scheduled_for),
            status: job.status.as_str().to_string(),
            attempt_count: i32::try_from(job.attempt_count).unwrap_or(i32::MAX),
            generated_sql_query: job.generated_query.clone(),
            record_count: job.record_count.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            error_message: job.error_message.clone(),
            worker_id: job.worker_id.clone(),
            created_at: encode_timestamp(job.created_at),
            started_at: job.started_at.map(encode_timestamp),
            finished_at: job.finished_at.map(encode_timestamp),
            updated_at: encode_timestamp(updated_at),
        }
    }

    pub fn into_execution(self) -> Result<JobExecution, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: self.job_id.clone(),
            reason,
        };
        let status = self.status.parse().map_err(corrupt)?;
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|_| corrupt(format!("negative attempt_count {}", self.attempt_count)))?;
        let record_count = self
            .record_count
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt("negative record_count".to_string()))?;

        Ok(JobExecution {
            job_id: JobId::from(self.job_id.clone()),
            rule_id: self.rule_id,
            table_name: self.table_name,
            metric_name: self.metric_name,
            scheduled_for: decode_timestamp(&self.scheduled_for)?,
            status,
            attempt_count,
            generated_query: self.generated_sql_query,
            record_count,
            error_message: self.error_message,
            worker_id: self.worker_id,
            created_at: decode_timestamp(&self.created_at)?,
            started_at: decode_optional(self.started_at.as_deref())?,
            finished_at: decode_optional(self.finished_at.as_deref())?,
        })
    }
}
