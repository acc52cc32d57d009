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


use crate::commands::open_store;
use crate::config::KpiflowConfig;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use kpiflow::{JobExecution, JobStatus, RuleStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn status(config: &KpiflowConfig, limit: i64, status: Option<JobStatus>) -> Result<()> {
    let store = open_store(config, Arc::new(config.build_catalog()?)).await?;

    let counts = store.status_counts().await?;
    for (status, count) in &counts {
        println!("{:<10} {}", status.as_str(), count);
    }
    if counts.is_empty() {
        println!("no job executions recorded");
        return Ok(());
    }

    let executions = store.list_executions(status, limit).await?;
    if !executions.is_empty() {
        println!();
    }
    for execution in &executions {
        println!("{}", format_execution(execution));
    }
    Ok(())
}

fn format_execution(execution: &JobExecution) -> String {
    let mut line = format!(
        "{}  {:<10} attempts={}",
        execution.job_id,
        execution.status.as_str(),
        execution.attempt_count
    );
    if let Some(count) = execution.record_count {
        line.push_str(&format!(" records={}", count));
    }
    if let Some(error) = &execution.error_message {
        line.push_str(&format!(" error={:?}", error));
    }
    line
}

pub async fn recover(config: &KpiflowConfig, older_than_minutes: Option<u64>) -> Result<()> {
    let threshold = match older_than_minutes {
        Some(minutes) => Duration::from_secs(minutes * 60),
        None => config.scheduler_config()?.stale_job_threshold(),
    };
    let threshold = chrono::Duration::from_std(threshold).context("threshold out of range")?;

    let store = open_store(config, Arc::new(config.build_catalog()?)).await?;
    let now = Utc::now();
    let recovered = store.recover_stale(now - threshold, now).await?;

    info!(count = recovered.len(), "Recovered stale jobs");
    for job_id in &recovered {
        println!("failed   {}", job_id);
    }
    println!("{} stale jobs recovered", recovered.len());
    Ok(())
}

pub async fn prune(config: &KpiflowConfig, older_than_days: Option<u64>) -> Result<()> {
    let retention = match older_than_days {
        Some(days) => Duration::from_secs(days * 86_400),
        None => config.scheduler_config()?.result_retention().ok_or_else(|| {
            anyhow!("no retention configured, pass --older-than-days or set scheduler.result_retention_days")
        })?,
    };
    let retention = chrono::Duration::from_std(retention).context("retention out of range")?;

    let store = open_store(config, Arc::new(config.build_catalog()?)).await?;
    let removed = store.prune_finished(Utc::now() - retention).await?;

    info!(count = removed, "Pruned finished jobs");
    println!("{} finished jobs removed", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kpiflow::{Catalog, JobId, RawRuleDefinition, RuleDefinition};

    #[test]
    fn test_format_failed_execution() {
        let scheduled_for = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let raw = RawRuleDefinition::new("r1", "du_metrics", "cpu_usage", "avg", "1-hour", "EVERYHOUR");
        let rule = RuleDefinition::from_raw(&raw, &Catalog::default()).unwrap();
        let mut execution =
            JobExecution::pending(&rule, scheduled_for, "SELECT 1".to_string(), scheduled_for);
        execution.status = JobStatus::Failed;
        execution.attempt_count = 3;
        execution.error_message = Some("connection reset".to_string());

        let line = format_execution(&execution);
        assert!(line.starts_with(&JobId::new("r1", scheduled_for).to_string()));
        assert!(line.contains("failed"));
        assert!(line.contains("attempts=3"));
        assert!(line.contains("error=\"connection reset\""));
        assert!(!line.contains("records="));
    }
}
