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


use crate::cli::RunArgs;
use crate::commands::open_store;
use crate::config::KpiflowConfig;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use kpiflow::{Database, Dialect, DieselQueryBackend, JobReport, Scheduler};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(mut config: KpiflowConfig, args: &RunArgs) -> Result<()> {
    args.apply(&mut config.scheduler);
    check_dialect(config.backend.dialect, DieselQueryBackend::DIALECT)?;
    let sink = config.results_sink()?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%addr, "Serving metrics");
    }

    let catalog = Arc::new(config.build_catalog()?);
    let scheduler_config = config.scheduler_config()?;
    let store = open_store(&config, catalog.clone()).await?;

    let backend_database = if config.backend_url() == config.database.url {
        store.database().clone()
    } else {
        let pool_size = u32::try_from(scheduler_config.max_concurrent_jobs()).unwrap_or(u32::MAX);
        Database::new(config.backend_url(), pool_size).context("failed to create backend pool")?
    };
    let mut backend = DieselQueryBackend::new(backend_database)?;
    if let Some(sink) = sink {
        info!(table = sink.table(), "Storing aggregate results");
        backend = backend.with_results_sink(sink);
    }

    let scheduler = Scheduler::new(scheduler_config, catalog, Arc::new(store), Arc::new(backend));

    if args.once {
        let now = args.at.unwrap_or_else(Utc::now);
        let reports = scheduler.run_once(now).await?;
        print_reports(&reports)?;
        return Ok(());
    }

    info!(
        check_interval = ?scheduler.config().check_interval(),
        max_concurrent_jobs = scheduler.config().max_concurrent_jobs(),
        worker_id = %scheduler.engine().worker_id(),
        "Starting scheduler"
    );
    let handle = scheduler.start().await;

    shutdown_signal().await?;
    info!("Shutdown requested, draining in-flight jobs");

    let report = handle.shutdown().await;
    if !report.aborted.is_empty() {
        warn!(count = report.aborted.len(), "Jobs aborted after grace period");
    }
    info!(completed = report.completed.len(), "Scheduler stopped");
    Ok(())
}

/// Generated SQL is only valid for the dialect the backend executes.
fn check_dialect(configured: Dialect, supported: Dialect) -> Result<()> {
    if configured != supported {
        bail!(
            "backend dialect '{}' is not supported by the query backend, which runs {} SQL",
            configured.as_str(),
            supported.as_str()
        );
    }
    Ok(())
}

/// One JSON line per finished job, a short note for the rest.
fn print_reports(reports: &[JobReport]) -> Result<()> {
    for report in reports {
        match report.result() {
            Some(result) => println!("{}", serde_json::to_string(&result)?),
            None => eprintln!("{}: {:?}", report.rule_id(), report),
        }
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dialect() {
        assert!(check_dialect(Dialect::Postgres, Dialect::Postgres).is_ok());
        let err = check_dialect(Dialect::Presto, Dialect::Postgres).unwrap_err();
        assert!(err.to_string().contains("'presto'"));
    }

    #[tokio::test]
    async fn test_run_refuses_presto_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KpiflowConfig::default();
        config.database.url = format!("sqlite://{}", dir.path().join("kpiflow.db").display());
        config.backend.dialect = Dialect::Presto;
        let args = RunArgs {
            once: true,
            ..RunArgs::default()
        };

        let err = run(config, &args).await.unwrap_err();

        assert!(err.to_string().contains("presto"));
        assert!(!dir.path().join("kpiflow.db").exists());
    }
}
