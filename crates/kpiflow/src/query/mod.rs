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

//! Query generation.
//!
//! [`QueryGenerator::generate`] turns one [`RuleDefinition`] and its due
//! instant into a [`GeneratedQuery`]: a grouped aggregation over the rule's
//! table, bucketed by the rule's granularity, bounded to the evaluation
//! window, optionally filtered and thresholded. The output is a pure
//! function of the rule, the instant, the dialect and the catalog, so equal
//! inputs always produce byte-identical SQL.
//!
//! For the hourly `avg(cpu_usage)` rule due at 09:00 the PostgreSQL output is
//!
//! ```sql
//! SELECT "id" AS "entity_id", date_trunc('hour', "timestamp") AS "time_bucket",
//!        avg("cpu_usage") AS "tavg_1h_cpu_usage"
//! FROM "du_metrics"
//! WHERE "timestamp" >= $1 AND "timestamp" < $2
//! GROUP BY "id", date_trunc('hour', "timestamp")
//! ORDER BY "entity_id", "time_bucket"
//! ```
//!
//! (emitted on one line) with `$1 = 08:00` and `$2 = 09:00`.

pub mod builder;
pub mod dialect;
pub mod ident;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::DefinitionError;
use crate::models::{
    Aggregation, CompareOp, FilterPredicate, FilterValue, Granularity, JobId, RawRuleDefinition,
    RuleDefinition,
};
use builder::SqlBuilder;
use ident::{quote_identifier, validate_identifier, validate_table_name};

pub use builder::{GeneratedQuery, SqlValue};
pub use dialect::Dialect;

/// Half-open interval `[start, end)` of rows a job aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The granularity-wide window ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, granularity: &Granularity) -> Self {
        Self {
            start: end - granularity.duration(),
            end,
        }
    }
}

/// Builds aggregation queries from rule definitions.
#[derive(Debug, Clone)]
pub struct QueryGenerator {
    catalog: Arc<Catalog>,
    dialect: Dialect,
}

impl QueryGenerator {
    pub fn new(catalog: Arc<Catalog>, dialect: Dialect) -> Self {
        Self { catalog, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Validates and generates from an untrusted record.
    pub fn generate_raw(
        &self,
        raw: &RawRuleDefinition,
        scheduled_for: DateTime<Utc>,
    ) -> Result<GeneratedQuery, DefinitionError> {
        let rule = self.catalog.validate_rule(raw)?;
        self.generate(&rule, scheduled_for)
    }

    /// Generates the query for `rule` due at `scheduled_for`.
    pub fn generate(
        &self,
        rule: &RuleDefinition,
        scheduled_for: DateTime<Utc>,
    ) -> Result<GeneratedQuery, DefinitionError> {
        if !self.catalog.supports(rule.aggregation) {
            return Err(DefinitionError::UnsupportedAggregation(
                rule.aggregation.to_string(),
            ));
        }
        if !self.catalog.supports_granularity(&rule.granularity) {
            return Err(DefinitionError::UnsupportedGranularity(
                rule.granularity.name.clone(),
            ));
        }
        validate_table_name(&rule.table_name)?;
        validate_identifier(&rule.entity_column)?;
        validate_identifier(&rule.timestamp_column)?;
        if rule.metric_names.is_empty() {
            return Err(DefinitionError::InvalidRule {
                rule_id: rule.rule_id.clone(),
                reason: "no metric columns".to_string(),
            });
        }
        for metric in &rule.metric_names {
            validate_identifier(metric)?;
        }
        if let Some(filter) = &rule.filter_predicate {
            filter.validate()?;
        }

        let window = TimeWindow::ending_at(scheduled_for, &rule.granularity);
        let ts = quote_identifier(&rule.timestamp_column);
        let bucket = self
            .dialect
            .bucket_expression(&ts, rule.granularity.hours);
        let aggregates: Vec<(String, String)> = rule
            .metric_names
            .iter()
            .map(|metric| {
                let expr = self.dialect.aggregate_expression(
                    rule.aggregation,
                    &quote_identifier(metric),
                    &ts,
                );
                (expr, metric_alias(rule, metric))
            })
            .collect();

        let mut sql = SqlBuilder::new(self.dialect);
        sql.push("SELECT ")
            .push_identifier(&rule.entity_column)
            .push(" AS \"entity_id\", ")
            .push(&bucket)
            .push(" AS \"time_bucket\"");
        for (expr, alias) in &aggregates {
            sql.push(", ").push_output(expr, alias);
        }

        sql.push(" FROM ").push_table(&rule.table_name);
        sql.push(" WHERE ")
            .push(&ts)
            .push(" >= ")
            .push_param(SqlValue::Timestamp(window.start))
            .push(" AND ")
            .push(&ts)
            .push(" < ")
            .push_param(SqlValue::Timestamp(window.end));
        if let Some(filter) = &rule.filter_predicate {
            sql.push(" AND (");
            push_filter(&mut sql, filter);
            sql.push(")");
        }

        sql.push(" GROUP BY ")
            .push_identifier(&rule.entity_column)
            .push(", ")
            .push(&bucket);

        if rule.is_threshold() {
            sql.push(" HAVING ");
            for (i, (expr, _)) in aggregates.iter().enumerate() {
                if i > 0 {
                    sql.push(" OR ");
                }
                push_limits(&mut sql, expr, rule.lower_limit, rule.upper_limit);
            }
        }

        sql.push(" ORDER BY \"entity_id\", \"time_bucket\"");
        let mut query = sql.finish();
        query.job_id = Some(JobId::new(&rule.rule_id, scheduled_for));
        Ok(query)
    }
}

/// Output column name: `t<agg>_<hours>h_<metric>`.
pub fn metric_alias(rule: &RuleDefinition, metric: &str) -> String {
    column_alias(rule.aggregation, rule.granularity.hours, metric)
}

pub(crate) fn column_alias(aggregation: Aggregation, hours: u32, metric: &str) -> String {
    format!("t{}_{}h_{}", aggregation.as_str(), hours, metric)
}

fn push_limits(sql: &mut SqlBuilder, expr: &str, lower: Option<f64>, upper: Option<f64>) {
    sql.push("(");
    let mut first = true;
    if let Some(lower) = lower {
        sql.push(expr).push(" <= ").push_param(SqlValue::Float(lower));
        first = false;
    }
    if let Some(upper) = upper {
        if !first {
            sql.push(" OR ");
        }
        sql.push(expr).push(" >= ").push_param(SqlValue::Float(upper));
    }
    sql.push(")");
}

fn push_filter(sql: &mut SqlBuilder, filter: &FilterPredicate) {
    match filter {
        FilterPredicate::All { all } => push_group(sql, all, " AND "),
        FilterPredicate::Any { any } => push_group(sql, any, " OR "),
        FilterPredicate::Not { not } => {
            sql.push("NOT (");
            push_filter(sql, not);
            sql.push(")");
        }
        FilterPredicate::Compare { column, op, value } => {
            push_comparison(sql, column, *op, value.as_ref())
        }
    }
}

fn push_group(sql: &mut SqlBuilder, items: &[FilterPredicate], joiner: &str) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            sql.push(joiner);
        }
        sql.push("(");
        push_filter(sql, item);
        sql.push(")");
    }
}

fn push_comparison(sql: &mut SqlBuilder, column: &str, op: CompareOp, value: Option<&FilterValue>) {
    sql.push_identifier(column);
    let operator = match op {
        CompareOp::IsNull => {
            sql.push(" IS NULL");
            return;
        }
        CompareOp::IsNotNull => {
            sql.push(" IS NOT NULL");
            return;
        }
        CompareOp::In => {
            let items = match value {
                Some(FilterValue::List(items)) if !items.is_empty() => items,
                // An empty IN list matches nothing.
                _ => {
                    sql.push(" IN (NULL)");
                    return;
                }
            };
            sql.push(" IN (");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    sql.push(", ");
                }
                sql.push_param(to_sql_value(item));
            }
            sql.push(")");
            return;
        }
        CompareOp::Eq => " = ",
        CompareOp::Ne => " <> ",
        CompareOp::Lt => " < ",
        CompareOp::Le => " <= ",
        CompareOp::Gt => " > ",
        CompareOp::Ge => " >= ",
        CompareOp::Like => " LIKE ",
    };
    sql.push(operator);
    match value {
        Some(v) => {
            sql.push_param(to_sql_value(v));
        }
        None => {
            sql.push("NULL");
        }
    }
}

fn to_sql_value(value: &FilterValue) -> SqlValue {
    match value {
        FilterValue::Bool(b) => SqlValue::Bool(*b),
        FilterValue::Integer(i) => SqlValue::Integer(*i),
        FilterValue::Float(f) => SqlValue::Float(*f),
        FilterValue::Text(s) => SqlValue::Text(s.clone()),
        // Nested lists are rejected by validation.
        FilterValue::List(_) => SqlValue::Text(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Aggregation, MetricNames};
    use chrono::TimeZone;

    fn catalog() -> Arc<Catalog> {
        Arc::new(Catalog::default())
    }

    fn raw() -> RawRuleDefinition {
        RawRuleDefinition::new("r1", "du_metrics", "cpu_usage", "avg", "1-hour", "EVERYHOUR")
    }

    fn nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_hourly_avg_example() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let query = generator.generate_raw(&raw(), nine()).unwrap();
        assert_eq!(
            query.sql,
            "SELECT \"id\" AS \"entity_id\", date_trunc('hour', \"timestamp\") AS \"time_bucket\", \
             avg(\"cpu_usage\") AS \"tavg_1h_cpu_usage\" FROM \"du_metrics\" \
             WHERE \"timestamp\" >= $1 AND \"timestamp\" < $2 \
             GROUP BY \"id\", date_trunc('hour', \"timestamp\") \
             ORDER BY \"entity_id\", \"time_bucket\""
        );
        assert_eq!(
            query.params,
            vec![
                SqlValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()),
                SqlValue::Timestamp(nine()),
            ]
        );
        assert_eq!(query.outputs, vec!["tavg_1h_cpu_usage".to_string()]);
        assert_eq!(query.job_id, Some(JobId::new("r1", nine())));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.metric_name = MetricNames::from("cpu_usage,mem_usage");
        record.filter_predicate = Some(
            serde_json::from_str(
                r#"{"any": [{"column": "region", "op": "in", "value": ["a", "b"]},
                            {"column": "host", "op": "like", "value": "db-%"}]}"#,
            )
            .unwrap(),
        );
        record.upper_limit = Some(90.0);
        let a = generator.generate_raw(&record, nine()).unwrap();
        let b = generator.generate_raw(&record, nine()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sql.as_bytes(), b.sql.as_bytes());
        assert_eq!(a.inline().as_bytes(), b.inline().as_bytes());
    }

    #[test]
    fn test_unsupported_aggregation_produces_no_query() {
        let restricted = Catalog::production()
            .aggregations([Aggregation::Sum, Aggregation::Count])
            .build()
            .unwrap();
        let rule = RuleDefinition::from_raw(&raw(), &Catalog::default()).unwrap();
        let generator = QueryGenerator::new(Arc::new(restricted), Dialect::Postgres);
        assert_eq!(
            generator.generate(&rule, nine()).unwrap_err(),
            DefinitionError::UnsupportedAggregation("avg".to_string())
        );
    }

    #[test]
    fn test_unsupported_granularity_produces_no_query() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut rule = RuleDefinition::from_raw(&raw(), &Catalog::default()).unwrap();
        rule.granularity = Granularity::new("90-minute", 1);
        assert_eq!(
            generator.generate(&rule, nine()).unwrap_err(),
            DefinitionError::UnsupportedGranularity("90-minute".to_string())
        );
    }

    #[test]
    fn test_hostile_filter_values_are_bound_not_interpolated() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.filter_predicate = Some(FilterPredicate::compare(
            "region",
            CompareOp::Eq,
            Some(FilterValue::Text("x' OR '1'='1".to_string())),
        ));
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query.sql.contains("AND (\"region\" = $3)"));
        assert!(!query.sql.contains("OR '1'='1"));
        assert_eq!(query.params[2], SqlValue::Text("x' OR '1'='1".to_string()));
        assert!(query.inline().contains("\"region\" = 'x'' OR ''1''=''1'"));
    }

    #[test]
    fn test_hostile_identifiers_rejected() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut rule = RuleDefinition::from_raw(&raw(), &Catalog::default()).unwrap();
        rule.metric_names = vec!["cpu\") FROM secrets --".to_string()];
        assert!(matches!(
            generator.generate(&rule, nine()),
            Err(DefinitionError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_six_hour_buckets_floor_the_epoch() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.granularity = "6-hour".to_string();
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query
            .sql
            .contains("to_timestamp(floor(extract(epoch from \"timestamp\") / 21600) * 21600)"));
        assert_eq!(
            query.params[0],
            SqlValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_presto_dialect() {
        let generator = QueryGenerator::new(catalog(), Dialect::Presto);
        let mut record = raw();
        record.aggregation = "last".to_string();
        record.granularity = "1-week".to_string();
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query.sql.contains("date_trunc('week', \"timestamp\")"));
        assert!(query.sql.contains("max_by(\"cpu_usage\", \"timestamp\") AS \"tlast_168h_cpu_usage\""));
        assert!(query.sql.contains(">= ? AND \"timestamp\" < ?"));
        assert!(query
            .inline()
            .contains("< TIMESTAMP '2024-01-01 09:00:00 UTC'"));
    }

    #[test]
    fn test_median_uses_ordered_set_aggregate_on_postgres() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.aggregation = "median".to_string();
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query
            .sql
            .contains("percentile_cont(0.5) WITHIN GROUP (ORDER BY \"cpu_usage\") AS \"tmedian_1h_cpu_usage\""));
    }

    #[test]
    fn test_threshold_limits_become_having_clause() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.lower_limit = Some(5.0);
        record.upper_limit = Some(95.5);
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query.sql.contains(
            " HAVING (avg(\"cpu_usage\") <= $3 OR avg(\"cpu_usage\") >= $4) ORDER BY"
        ));
        assert_eq!(query.params[2], SqlValue::Float(5.0));
        assert_eq!(query.params[3], SqlValue::Float(95.5));
    }

    #[test]
    fn test_schema_qualified_table_and_custom_columns() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.table_name = "analytics.du_metrics".to_string();
        record.entity_column = Some("du_id".to_string());
        record.timestamp_column = Some("collected_at".to_string());
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query.sql.starts_with("SELECT \"du_id\" AS \"entity_id\", date_trunc('hour', \"collected_at\")"));
        assert!(query.sql.contains("FROM \"analytics\".\"du_metrics\" WHERE"));
    }

    #[test]
    fn test_null_checks_and_negation() {
        let generator = QueryGenerator::new(catalog(), Dialect::Postgres);
        let mut record = raw();
        record.filter_predicate = Some(FilterPredicate::Not {
            not: Box::new(FilterPredicate::compare("deleted_at", CompareOp::IsNotNull, None)),
        });
        let query = generator.generate_raw(&record, nine()).unwrap();
        assert!(query.sql.contains("AND (NOT (\"deleted_at\" IS NOT NULL))"));
        assert_eq!(query.params.len(), 2);
    }
}
