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

//! Rule definitions.
//!
//! Rules arrive as [`RawRuleDefinition`] records (JSON files, database rows)
//! and are untrusted. They become [`RuleDefinition`] only after passing
//! [`RuleDefinition::from_raw`], which checks every enumerated field against
//! a [`Catalog`] and every identifier against the identifier grammar. Unknown
//! aggregations or granularities are therefore rejected at load time and
//! never reach the execution engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::catalog::Catalog;
use crate::error::DefinitionError;
use crate::models::filter::FilterPredicate;
use crate::query::column_alias;
use crate::query::ident::{validate_identifier, validate_table_name, MAX_IDENTIFIER_LENGTH};

const MAX_RULE_ID_LENGTH: usize = 128;

/// Aggregation functions a rule may apply to its metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Median,
    Std,
    Var,
    First,
    Last,
}

impl Aggregation {
    /// Every aggregation kpiflow knows how to render.
    pub const ALL: [Aggregation; 10] = [
        Aggregation::Sum,
        Aggregation::Avg,
        Aggregation::Count,
        Aggregation::Min,
        Aggregation::Max,
        Aggregation::Median,
        Aggregation::Std,
        Aggregation::Var,
        Aggregation::First,
        Aggregation::Last,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Median => "median",
            Aggregation::Std => "std",
            Aggregation::Var => "var",
            Aggregation::First => "first",
            Aggregation::Last => "last",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Aggregation::ALL
            .iter()
            .copied()
            .find(|agg| agg.as_str() == normalized)
            .ok_or_else(|| DefinitionError::UnsupportedAggregation(s.to_string()))
    }
}

/// A named bucket width, e.g. `1-hour` or `2-week`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Granularity {
    pub name: String,
    pub hours: u32,
}

impl Granularity {
    pub fn new(name: impl Into<String>, hours: u32) -> Self {
        Self {
            name: name.into(),
            hours,
        }
    }

    /// Bucket width in seconds.
    pub fn seconds(&self) -> i64 {
        i64::from(self.hours) * 3600
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours))
    }
}

/// One metric column or several, as found in rule input.
///
/// A single string may carry a comma separated list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricNames {
    One(String),
    Many(Vec<String>),
}

impl MetricNames {
    pub fn to_vec(&self) -> Vec<String> {
        let items: Vec<&str> = match self {
            MetricNames::One(s) => s.split(',').collect(),
            MetricNames::Many(v) => v.iter().map(String::as_str).collect(),
        };
        items
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl From<&str> for MetricNames {
    fn from(value: &str) -> Self {
        MetricNames::One(value.to_string())
    }
}

fn default_enabled() -> bool {
    true
}

/// A rule record as supplied by an external loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRuleDefinition {
    pub rule_id: String,
    pub table_name: String,
    pub metric_name: MetricNames,
    pub aggregation: String,
    pub granularity: String,
    pub schedule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_predicate: Option<FilterPredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RawRuleDefinition {
    /// Creates a minimal enabled record; optional fields start unset.
    pub fn new(
        rule_id: impl Into<String>,
        table_name: impl Into<String>,
        metric_name: impl Into<String>,
        aggregation: impl Into<String>,
        granularity: impl Into<String>,
        schedule_name: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            table_name: table_name.into(),
            metric_name: MetricNames::One(metric_name.into()),
            aggregation: aggregation.into(),
            granularity: granularity.into(),
            schedule_name: schedule_name.into(),
            filter_predicate: None,
            entity_column: None,
            timestamp_column: None,
            lower_limit: None,
            upper_limit: None,
            enabled: true,
        }
    }
}

/// A validated, immutable snapshot of one rule for the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDefinition {
    pub rule_id: String,
    pub table_name: String,
    pub metric_names: Vec<String>,
    pub aggregation: Aggregation,
    pub granularity: Granularity,
    pub schedule_name: String,
    pub filter_predicate: Option<FilterPredicate>,
    /// Column identifying the entity rows are grouped by.
    pub entity_column: String,
    /// Column bucketed by granularity.
    pub timestamp_column: String,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
}

impl RuleDefinition {
    pub const DEFAULT_ENTITY_COLUMN: &'static str = "id";
    pub const DEFAULT_TIMESTAMP_COLUMN: &'static str = "timestamp";

    /// Validates a raw record against `catalog`.
    pub fn from_raw(raw: &RawRuleDefinition, catalog: &Catalog) -> Result<Self, DefinitionError> {
        let rule_id = raw.rule_id.trim();
        if rule_id.is_empty() || rule_id.len() > MAX_RULE_ID_LENGTH {
            return Err(DefinitionError::InvalidRule {
                rule_id: raw.rule_id.clone(),
                reason: format!("rule_id must be 1-{} characters", MAX_RULE_ID_LENGTH),
            });
        }
        let invalid = |reason: String| DefinitionError::InvalidRule {
            rule_id: rule_id.to_string(),
            reason,
        };

        let aggregation: Aggregation = raw.aggregation.parse()?;
        if !catalog.supports(aggregation) {
            return Err(DefinitionError::UnsupportedAggregation(
                raw.aggregation.clone(),
            ));
        }
        let granularity = catalog.granularity(&raw.granularity)?;

        validate_table_name(&raw.table_name)?;

        let metric_names = raw.metric_name.to_vec();
        if metric_names.is_empty() {
            return Err(invalid("at least one metric_name is required".to_string()));
        }
        let mut seen = BTreeSet::new();
        for metric in &metric_names {
            validate_identifier(metric)?;
            if !seen.insert(metric.as_str()) {
                return Err(invalid(format!("metric '{}' listed twice", metric)));
            }
            // PostgreSQL truncates longer names, which could merge two output columns.
            let alias = column_alias(aggregation, granularity.hours, metric);
            if alias.len() > MAX_IDENTIFIER_LENGTH {
                return Err(invalid(format!(
                    "output column '{}' exceeds {} bytes",
                    alias, MAX_IDENTIFIER_LENGTH
                )));
            }
        }

        let entity_column = raw
            .entity_column
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_ENTITY_COLUMN.to_string());
        validate_identifier(&entity_column)?;
        let timestamp_column = raw
            .timestamp_column
            .clone()
            .unwrap_or_else(|| Self::DEFAULT_TIMESTAMP_COLUMN.to_string());
        validate_identifier(&timestamp_column)?;

        if let Some(filter) = &raw.filter_predicate {
            filter.validate()?;
        }

        for (label, limit) in [("lower_limit", raw.lower_limit), ("upper_limit", raw.upper_limit)] {
            if matches!(limit, Some(v) if !v.is_finite()) {
                return Err(invalid(format!("{} must be a finite number", label)));
            }
        }

        let schedule_name = raw.schedule_name.trim();
        if schedule_name.is_empty() {
            return Err(invalid("schedule_name is required".to_string()));
        }

        Ok(Self {
            rule_id: rule_id.to_string(),
            table_name: raw.table_name.clone(),
            metric_names,
            aggregation,
            granularity,
            schedule_name: schedule_name.to_string(),
            filter_predicate: raw.filter_predicate.clone(),
            entity_column,
            timestamp_column,
            lower_limit: raw.lower_limit,
            upper_limit: raw.upper_limit,
        })
    }

    /// Metric names joined for reporting.
    pub fn metric_label(&self) -> String {
        self.metric_names.join(",")
    }

    /// True when the rule only keeps buckets breaching a limit.
    pub fn is_threshold(&self) -> bool {
        self.lower_limit.is_some() || self.upper_limit.is_some()
    }
}
