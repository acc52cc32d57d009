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


//! Offline rule tooling: validate, render, due and import.

use crate::commands::{open_store, read_rules};
use crate::config::KpiflowConfig;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use kpiflow::trigger::truncate_to_minute;
use kpiflow::{
    Catalog, DefinitionError, Dialect, DueRules, GeneratedQuery, QueryGenerator,
    RawRuleDefinition, TriggerEngine,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub fn validate(config: &KpiflowConfig, file: &Path) -> Result<()> {
    let catalog = config.build_catalog()?;
    let raws = read_rules(file)?;
    let validated = catalog.validate_rules(&raws);

    for rule in &validated.rules {
        println!("ok       {}", rule.rule_id);
    }
    for (rule_id, error) in &validated.rejected {
        println!("invalid  {}: {}", rule_id, error);
    }

    if !validated.rejected.is_empty() {
        bail!(
            "{} of {} rules are invalid",
            validated.rejected.len(),
            raws.len()
        );
    }
    println!("{} rules valid", validated.rules.len());
    Ok(())
}

/// Generates the query for each selected rule at `at`.
pub fn render_queries(
    catalog: Arc<Catalog>,
    dialect: Dialect,
    raws: &[RawRuleDefinition],
    rule_id: Option<&str>,
    at: DateTime<Utc>,
) -> Vec<(String, Result<GeneratedQuery, DefinitionError>)> {
    let generator = QueryGenerator::new(catalog, dialect);
    let scheduled_for = truncate_to_minute(at);
    raws.iter()
        .filter(|raw| rule_id.map_or(true, |id| raw.rule_id == id))
        .map(|raw| (raw.rule_id.clone(), generator.generate_raw(raw, scheduled_for)))
        .collect()
}

pub fn render(
    config: &KpiflowConfig,
    file: &Path,
    rule_id: Option<&str>,
    at: Option<DateTime<Utc>>,
    dialect: Option<Dialect>,
) -> Result<()> {
    let catalog = Arc::new(config.build_catalog()?);
    let raws = read_rules(file)?;
    let dialect = dialect.unwrap_or(config.backend.dialect);
    let rendered = render_queries(catalog, dialect, &raws, rule_id, at.unwrap_or_else(Utc::now));

    if rendered.is_empty() {
        match rule_id {
            Some(id) => bail!("rule '{}' not found in {}", id, file.display()),
            None => bail!("{} contains no rules", file.display()),
        }
    }

    let mut failures = 0;
    for (rule_id, outcome) in rendered {
        match outcome {
            Ok(query) => println!("-- {} ({})\n{};\n", rule_id, dialect, query.inline()),
            Err(error) => {
                failures += 1;
                eprintln!("-- {}: {}", rule_id, error);
            }
        }
    }
    if failures > 0 {
        bail!("{} rules could not be rendered", failures);
    }
    Ok(())
}

/// Evaluates which rules are due at `at`; invalid rules land in
/// [`DueRules::rejected`].
pub fn due_at(catalog: Arc<Catalog>, raws: &[RawRuleDefinition], at: DateTime<Utc>) -> DueRules {
    let validated = catalog.validate_rules(raws);
    let trigger = TriggerEngine::new(catalog);
    let mut due = trigger.due_rules(at, &validated.rules, &HashMap::new());
    due.rejected.extend(validated.rejected);
    due
}

pub fn due(config: &KpiflowConfig, file: &Path, at: Option<DateTime<Utc>>) -> Result<()> {
    let catalog = Arc::new(config.build_catalog()?);
    let raws = read_rules(file)?;
    let result = due_at(catalog, &raws, at.unwrap_or_else(Utc::now));

    if let Some(instant) = result.instant {
        println!("evaluated {}", instant.to_rfc3339());
    }
    for rule_id in &result.due {
        println!("due      {}", rule_id);
    }
    for (rule_id, error) in &result.rejected {
        println!("invalid  {}: {}", rule_id, error);
    }
    println!("{} of {} rules due", result.due.len(), raws.len());
    Ok(())
}

pub async fn import(config: &KpiflowConfig, file: &Path) -> Result<()> {
    let catalog = Arc::new(config.build_catalog()?);
    let raws = read_rules(file)?;

    let validated = catalog.validate_rules(&raws);
    if !validated.rejected.is_empty() {
        for (rule_id, error) in &validated.rejected {
            eprintln!("invalid  {}: {}", rule_id, error);
        }
        bail!(
            "refusing to import: {} of {} rules are invalid",
            validated.rejected.len(),
            raws.len()
        );
    }

    let store = open_store(config, catalog).await?;
    let saved = store.save_rules(&raws).await?;
    info!(count = saved, file = %file.display(), "Imported rules");
    println!("imported {} rules", saved);
    Ok(())
}
