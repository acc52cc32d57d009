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

//! Error types for every kpiflow component.
//!
//! The taxonomy mirrors how failures are handled at runtime:
//!
//! - [`DefinitionError`]: a rule is malformed. The rule is skipped for the
//!   current tick, logged, and never retried.
//! - [`BackendError`]: the query backend failed. Transient failures are
//!   retried by the execution engine; everything else is terminal.
//! - [`StoreError`]: the rule store could not be read or written. A read
//!   failure aborts the tick; a write failure is reported as an operational
//!   error distinct from job failures.
//! - [`ExecutorError`] and [`SchedulerError`]: faults of the runtime itself.

use thiserror::Error;

/// Errors raised while validating or interpreting a rule definition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DefinitionError {
    /// The aggregation is not in the supported set.
    #[error("Unsupported aggregation '{0}'")]
    UnsupportedAggregation(String),

    /// The granularity is not in the supported set.
    #[error("Unsupported granularity '{0}'")]
    UnsupportedGranularity(String),

    /// The schedule name has no recurrence mapping.
    #[error("Unknown schedule '{0}'")]
    UnknownSchedule(String),

    /// A table or column name failed identifier validation.
    #[error("Invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// The filter predicate is structurally invalid.
    #[error("Invalid filter predicate: {0}")]
    InvalidFilter(String),

    /// The rule violates another load-time constraint.
    #[error("Invalid rule '{rule_id}': {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// A catalog entry (schedule expression or time zone) could not be parsed.
    #[error("Invalid schedule '{name}': {reason}")]
    InvalidSchedule { name: String, reason: String },
}

/// Errors raised by the rule store accessor.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached to load rules.
    #[error("Rule store unavailable: {0}")]
    Unavailable(String),

    /// A connection could not be checked out of the pool.
    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    /// The database rejected a statement.
    #[error("Database error: {0}")]
    Query(#[from] diesel::result::Error),

    /// A result row could not be written.
    #[error("Failed to write job '{job_id}': {reason}")]
    WriteFailed { job_id: String, reason: String },

    /// A persisted value could not be decoded.
    #[error("Corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Schema migrations failed to apply.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// The connection string does not name a supported backend.
    #[error("Unsupported database url '{0}'")]
    UnsupportedUrl(String),
}

/// Errors raised by a query backend while running a generated query.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// A failure expected to clear on its own (dropped connection, lock
    /// timeout, serialization failure).
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// A failure that will recur on retry (bad column, syntax error).
    #[error("Backend error: {0}")]
    Permanent(String),

    /// The backend cancelled the statement because it exceeded its budget.
    #[error("Backend statement timed out: {0}")]
    Timeout(String),

    /// The work was cancelled before completion.
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl BackendError {
    /// Returns true when the error may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Errors raised by the execution engine itself.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The concurrency semaphore was closed.
    #[error("Worker pool closed")]
    PoolClosed,

    /// A job task panicked or was aborted.
    #[error("Job task failed to join: {0}")]
    Join(String),
}

/// Errors raised by the scheduler loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
