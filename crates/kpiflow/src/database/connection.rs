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

//! Connection pooling for PostgreSQL and SQLite.
//!
//! The backend is detected from the connection string:
//!
//! - `postgres://` or `postgresql://` selects PostgreSQL
//! - `sqlite://`, `file:` URIs, file paths and `:memory:` select SQLite
//!
//! Pools are managed by `deadpool-diesel`; Diesel work runs on the pool's
//! blocking threads through `interact`.

use deadpool_diesel::postgres::{Manager as PgManager, Pool as PgPool, Runtime as PgRuntime};
use deadpool_diesel::sqlite::{
    Manager as SqliteManager, Pool as SqlitePool, Runtime as SqliteRuntime,
};
use tracing::info;
use url::Url;

use crate::error::StoreError;

/// Database backend, detected from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Postgres,
    Sqlite,
}

impl BackendType {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(BackendType::Postgres);
        }

        if url.starts_with("sqlite://")
            || url.starts_with("file:")
            || url.starts_with('/')
            || url.starts_with("./")
            || url.starts_with("../")
            || url == ":memory:"
            || url.ends_with(".db")
            || url.ends_with(".sqlite")
            || url.ends_with(".sqlite3")
        {
            return Ok(BackendType::Sqlite);
        }

        Err(StoreError::UnsupportedUrl(redact(url)))
    }
}

/// Pool over either backend.
#[derive(Clone)]
pub enum AnyPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl std::fmt::Debug for AnyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyPool::Postgres(_) => write!(f, "AnyPool::Postgres(...)"),
            AnyPool::Sqlite(_) => write!(f, "AnyPool::Sqlite(...)"),
        }
    }
}

/// A shared connection pool.
///
/// `Database` is cheap to clone; clones share the same pool.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    backend: BackendType,
    display_url: String,
}

impl Database {
    /// Creates a pool of up to `max_size` connections.
    ///
    /// SQLite pools are always capped at one connection, which avoids
    /// "database is locked" errors under concurrent writers.
    pub fn new(connection_string: &str, max_size: u32) -> Result<Self, StoreError> {
        let backend = BackendType::from_url(connection_string)?;
        let display_url = redact(connection_string);

        let pool = match backend {
            BackendType::Postgres => {
                let manager = PgManager::new(connection_string, PgRuntime::Tokio1);
                let pool = PgPool::builder(manager)
                    .max_size(max_size.max(1) as usize)
                    .build()
                    .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;
                info!(url = %display_url, max_size, "PostgreSQL connection pool initialized");
                AnyPool::Postgres(pool)
            }
            BackendType::Sqlite => {
                let path = connection_string
                    .strip_prefix("sqlite://")
                    .unwrap_or(connection_string);
                let manager = SqliteManager::new(path, SqliteRuntime::Tokio1);
                let pool = SqlitePool::builder(manager)
                    .max_size(1)
                    .build()
                    .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;
                info!(url = %display_url, "SQLite connection pool initialized (size: 1)");
                AnyPool::Sqlite(pool)
            }
        };

        Ok(Self {
            pool,
            backend,
            display_url,
        })
    }

    pub fn backend(&self) -> BackendType {
        self.backend
    }

    /// Returns a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Connection string with any password removed.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Runs pending migrations for the detected backend.
    ///
    /// SQLite connections are switched to WAL mode with a busy timeout first.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        use diesel::prelude::*;
        use diesel_migrations::MigrationHarness;

        let applied = match &self.pool {
            AnyPool::Postgres(pool) => {
                let conn = pool
                    .get()
                    .await
                    .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;
                conn.interact(|conn| {
                    conn.run_pending_migrations(super::POSTGRES_MIGRATIONS)
                        .map(|versions| versions.len())
                        .map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?
            }
            AnyPool::Sqlite(pool) => {
                let conn = pool
                    .get()
                    .await
                    .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;
                conn.interact(|conn| {
                    diesel::sql_query("PRAGMA journal_mode=WAL;")
                        .execute(conn)
                        .map_err(|e| e.to_string())?;
                    diesel::sql_query("PRAGMA busy_timeout=30000;")
                        .execute(conn)
                        .map_err(|e| e.to_string())?;
                    conn.run_pending_migrations(super::SQLITE_MIGRATIONS)
                        .map(|versions| versions.len())
                        .map_err(|e| e.to_string())
                })
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?
            }
        }
        .map_err(StoreError::Migration)?;

        info!(applied, backend = ?self.backend, "Database migrations complete");
        Ok(())
    }
}

/// Strips the password from URL-shaped connection strings.
fn redact(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => connection_string.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_detection() {
        assert_eq!(
            BackendType::from_url("postgres://u:p@localhost/kpi").unwrap(),
            BackendType::Postgres
        );
        assert_eq!(
            BackendType::from_url("postgresql://localhost/kpi").unwrap(),
            BackendType::Postgres
        );
        for url in ["sqlite://kpi.db", ":memory:", "/var/lib/kpi.sqlite", "./kpi.db"] {
            assert_eq!(BackendType::from_url(url).unwrap(), BackendType::Sqlite);
        }
        assert!(BackendType::from_url("mysql://localhost/kpi").is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        assert_eq!(
            redact("postgres://kpi:secret@db:5432/kpi"),
            "postgres://kpi:***@db:5432/kpi"
        );
        assert_eq!(redact("./kpi.db"), "./kpi.db");
    }
}
