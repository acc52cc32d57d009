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


pub mod jobs;
pub mod rules;
pub mod run;

use crate::config::KpiflowConfig;
use anyhow::{Context, Result};
use kpiflow::{Catalog, Database, DieselRuleStore, RawRuleDefinition};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Reads a JSON array of rule definitions.
pub fn read_rules(path: &Path) -> Result<Vec<RawRuleDefinition>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| {
        format!(
            "{} is not a JSON array of rule definitions",
            path.display()
        )
    })
}

/// Connects to the rule store database and applies pending migrations.
pub async fn open_store(config: &KpiflowConfig, catalog: Arc<Catalog>) -> Result<DieselRuleStore> {
    let database = Database::new(&config.database.url, config.database.pool_size)
        .context("failed to create rule store pool")?;
    debug!(url = %database.display_url(), "Connected to rule store");
    database
        .run_migrations()
        .await
        .context("failed to run rule store migrations")?;
    Ok(DieselRuleStore::new(database, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_rules_accepts_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(
            &path,
            r#"[{"rule_id": "r1", "table_name": "du_metrics", "metric_name": "cpu_usage",
                 "aggregation": "avg", "granularity": "1-hour", "schedule_name": "EVERYHOUR"}]"#,
        )
        .unwrap();

        let rules = read_rules(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_id, "r1");
        assert!(rules[0].enabled);
    }

    #[test]
    fn test_read_rules_rejects_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{"rule_id": "r1"}"#).unwrap();

        let err = read_rules(&path).unwrap_err();
        assert!(err.to_string().contains("not a JSON array"));
    }
}
