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

//! Database access layer.
//!
//! kpiflow persists rule definitions and job executions in either
//! PostgreSQL or SQLite, selected at runtime from the connection URL. Both
//! backends share one schema definition ([`schema`]) restricted to column
//! types both support; timestamps are stored as fixed-width RFC 3339 text
//! (see [`universal_types`]) so they compare correctly as strings.

pub mod connection;
pub mod schema;
pub mod universal_types;

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub use connection::{AnyPool, BackendType, Database};

/// Embedded PostgreSQL migrations.
pub const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

/// Embedded SQLite migrations.
pub const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

/// Runs a blocking Diesel closure on a pooled connection of whichever backend
/// `$database` uses.
///
/// The closure body is expanded once per backend, so it must only use query
/// DSL supported by both. Pool and interaction failures become
/// [`StoreError::ConnectionPool`](crate::error::StoreError::ConnectionPool);
/// the body's own `Result` is returned for the caller to `?`.
macro_rules! with_connection {
    ($database:expr, |$conn:ident| $body:expr) => {{
        match $database.pool() {
            $crate::database::AnyPool::Postgres(pool) => {
                let obj = pool
                    .get()
                    .await
                    .map_err(|e| $crate::error::StoreError::ConnectionPool(e.to_string()))?;
                obj.interact(move |$conn: &mut diesel::PgConnection| $body)
                    .await
                    .map_err(|e| $crate::error::StoreError::ConnectionPool(e.to_string()))?
            }
            $crate::database::AnyPool::Sqlite(pool) => {
                let obj = pool
                    .get()
                    .await
                    .map_err(|e| $crate::error::StoreError::ConnectionPool(e.to_string()))?;
                obj.interact(move |$conn: &mut diesel::SqliteConnection| $body)
                    .await
                    .map_err(|e| $crate::error::StoreError::ConnectionPool(e.to_string()))?
            }
        }
    }};
}

pub(crate) use with_connection;
