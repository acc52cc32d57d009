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

//! The query backend seam.
//!
//! The execution engine only knows [`QueryBackend`]: something that runs a
//! [`GeneratedQuery`] within a time budget and reports how many rows it
//! produced. [`DieselQueryBackend`] is the PostgreSQL implementation; tests
//! and other warehouses plug in their own.
//!
//! Without a [`ResultsSink`] the backend only counts the aggregate rows. With
//! one, every aggregate value is written to the results table in the same
//! statement and the inserted row count is reported instead.

use std::time::Duration;

use async_trait::async_trait;
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{BigInt, Bool, Double, Text, Timestamptz};

use crate::database::{AnyPool, Database};
use crate::error::{BackendError, DefinitionError};
use crate::models::JobId;
use crate::query::ident::{quote_identifier, quote_table_name, validate_table_name};
use crate::query::{Dialect, GeneratedQuery, SqlValue};

/// Runs generated aggregation queries.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Executes `query` and returns the number of result rows.
    ///
    /// Implementations should give up once `budget` has elapsed and report
    /// [`BackendError::Timeout`].
    async fn execute(&self, query: &GeneratedQuery, budget: Duration) -> Result<u64, BackendError>;

    /// SQL dialect queries must be generated in.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

#[derive(QueryableByName)]
struct RecordCount {
    #[diesel(sql_type = BigInt)]
    record_count: i64,
}

/// Table receiving one row per aggregate value:
/// `(job_id, entity_id, time_bucket, metric_alias, metric_value)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsSink {
    table: String,
}

impl ResultsSink {
    /// Table created by the bundled migrations.
    pub const DEFAULT_TABLE: &'static str = "rule_execution_results";

    pub fn new(table: impl Into<String>) -> Result<Self, DefinitionError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Wraps `query` in an `INSERT ... SELECT` unpivoting its output columns.
    ///
    /// The query's own parameters keep their positions; the job id is bound
    /// once per output column after them.
    pub fn statement(&self, query: &GeneratedQuery) -> (String, Vec<SqlValue>) {
        let job_id = query.job_id.as_ref().map(JobId::to_string).unwrap_or_default();
        let mut params = query.params.clone();
        let mut selects = Vec::with_capacity(query.outputs.len());
        for alias in &query.outputs {
            params.push(SqlValue::Text(job_id.clone()));
            selects.push(format!(
                "SELECT {}, CAST(\"entity_id\" AS TEXT), \"time_bucket\", {}, \
                 CAST({} AS DOUBLE PRECISION) FROM generated",
                query.dialect.placeholder(params.len()),
                SqlValue::Text(alias.clone()).to_literal(query.dialect),
                quote_identifier(alias)
            ));
        }
        let sql = format!(
            "WITH generated AS ({}) INSERT INTO {} \
             (\"job_id\", \"entity_id\", \"time_bucket\", \"metric_alias\", \"metric_value\") {}",
            query.sql,
            quote_table_name(&self.table),
            selects.join(" UNION ALL ")
        );
        (sql, params)
    }
}

/// [`QueryBackend`] running queries on a PostgreSQL pool.
///
/// Each query runs in its own transaction with `statement_timeout` set to
/// the remaining budget. Without a sink it is wrapped in `SELECT COUNT(*)` so
/// only the row count crosses the wire.
#[derive(Debug, Clone)]
pub struct DieselQueryBackend {
    database: Database,
    sink: Option<ResultsSink>,
}

impl DieselQueryBackend {
    /// The only dialect this backend can execute.
    pub const DIALECT: Dialect = Dialect::Postgres;

    pub fn new(database: Database) -> Result<Self, BackendError> {
        match database.pool() {
            AnyPool::Postgres(_) => Ok(Self {
                database,
                sink: None,
            }),
            AnyPool::Sqlite(_) => Err(BackendError::Permanent(format!(
                "query backend requires PostgreSQL, got {}",
                database.display_url()
            ))),
        }
    }

    /// Stores aggregate values in `sink` instead of only counting them.
    pub fn with_results_sink(mut self, sink: ResultsSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn results_sink(&self) -> Option<&ResultsSink> {
        self.sink.as_ref()
    }
}

#[async_trait]
impl QueryBackend for DieselQueryBackend {
    fn dialect(&self) -> Dialect {
        Self::DIALECT
    }

    async fn execute(&self, query: &GeneratedQuery, budget: Duration) -> Result<u64, BackendError> {
        let pool = match self.database.pool() {
            AnyPool::Postgres(pool) => pool,
            AnyPool::Sqlite(_) => {
                return Err(BackendError::Permanent("query backend requires PostgreSQL".into()))
            }
        };

        let (sql, params) = match &self.sink {
            Some(sink) => sink.statement(query),
            None => (
                format!(
                    "SELECT COUNT(*) AS record_count FROM ({}) AS generated",
                    query.sql
                ),
                query.params.clone(),
            ),
        };
        let store_results = self.sink.is_some();
        let timeout_ms = budget.as_millis().clamp(1, i64::MAX as u128) as i64;

        let conn = pool
            .get()
            .await
            .map_err(|e| BackendError::Transient(format!("connection pool: {}", e)))?;

        let record_count = conn
            .interact(move |conn| {
                conn.transaction::<_, DieselError, _>(|conn| {
                    diesel::sql_query(format!("SET LOCAL statement_timeout = {}", timeout_ms))
                        .execute(conn)?;
                    let mut statement = diesel::sql_query(sql).into_boxed::<Pg>();
                    for param in params {
                        statement = bind_param(statement, param);
                    }
                    if store_results {
                        statement.execute(conn).map(|inserted| inserted as i64)
                    } else {
                        statement
                            .get_result::<RecordCount>(conn)
                            .map(|row| row.record_count)
                    }
                })
            })
            .await
            .map_err(|e| BackendError::Transient(format!("connection interaction: {}", e)))?
            .map_err(classify_error)?;

        Ok(record_count.max(0) as u64)
    }
}

fn bind_param(
    statement: BoxedSqlQuery<'static, Pg, SqlQuery>,
    value: SqlValue,
) -> BoxedSqlQuery<'static, Pg, SqlQuery> {
    match value {
        SqlValue::Text(v) => statement.bind::<Text, _>(v),
        SqlValue::Integer(v) => statement.bind::<BigInt, _>(v),
        SqlValue::Float(v) => statement.bind::<Double, _>(v),
        SqlValue::Bool(v) => statement.bind::<Bool, _>(v),
        SqlValue::Timestamp(v) => statement.bind::<Timestamptz, _>(v),
    }
}

/// Maps a Diesel failure onto the retry classification.
pub(crate) fn classify_error(error: DieselError) -> BackendError {
    match &error {
        DieselError::DatabaseError(kind, info) => {
            let message = info.message().to_string();
            match kind {
                DatabaseErrorKind::SerializationFailure
                | DatabaseErrorKind::ClosedConnection
                | DatabaseErrorKind::UnableToSendCommand => BackendError::Transient(message),
                _ if message.contains("statement timeout") => BackendError::Timeout(message),
                _ if message.contains("deadlock") || message.contains("lock timeout") => {
                    BackendError::Transient(message)
                }
                _ => BackendError::Permanent(message),
            }
        }
        DieselError::BrokenTransactionManager => BackendError::Transient(error.to_string()),
        _ => BackendError::Permanent(error.to_string()),
    }
}
