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

//! The lookup tables every component is constructed with.
//!
//! A [`Catalog`] bundles the schedule-name-to-recurrence mapping, the
//! granularity-name-to-hours mapping and the supported aggregation set. It is
//! immutable once built and shared behind an `Arc`; nothing in kpiflow reads
//! these tables from process-wide state, so tests can substitute their own.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::DefinitionError;
use crate::models::{Aggregation, Granularity, RawRuleDefinition, RuleDefinition};

pub use crate::trigger::schedule::ScheduleSpec;

/// Named schedules used by the production rule tables.
pub const DEFAULT_SCHEDULES: &[(&str, &str, &str)] = &[
    ("EVERYDAY8AMET", "0 8 * * *", "America/New_York"),
    ("EVERYHOUR", "0 * * * *", "UTC"),
    ("EVERYWEEK", "0 0 * * 0", "UTC"),
    ("EVERYHOURBYMIN10", "10 * * * *", "UTC"),
    ("EVERYDAY", "0 0 * * *", "UTC"),
    ("EVERYMINUTE", "* * * * *", "UTC"),
    ("EVERY5MINUTES", "*/5 * * * *", "UTC"),
    ("EVERY15MINUTES", "*/15 * * * *", "UTC"),
    ("EVERY30MINUTES", "*/30 * * * *", "UTC"),
];

/// Bucket widths used by the production rule tables.
pub const DEFAULT_GRANULARITIES: &[(&str, u32)] = &[
    ("1-hour", 1),
    ("2-hour", 2),
    ("4-hour", 4),
    ("6-hour", 6),
    ("12-hour", 12),
    ("1-day", 24),
    ("2-day", 48),
    ("3-day", 72),
    ("1-week", 168),
    ("2-week", 336),
];

/// Immutable schedule, granularity and aggregation tables.
#[derive(Debug, Clone)]
pub struct Catalog {
    schedules: BTreeMap<String, ScheduleSpec>,
    granularities: BTreeMap<String, u32>,
    aggregations: BTreeSet<Aggregation>,
}

impl Catalog {
    /// An empty builder supporting every aggregation and no schedules or
    /// granularities.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder {
            schedules: BTreeMap::new(),
            granularities: BTreeMap::new(),
            aggregations: Aggregation::ALL.iter().copied().collect(),
        }
    }

    /// A builder preloaded with the production tables.
    pub fn production() -> CatalogBuilder {
        let mut builder = Self::builder();
        for (name, expression, tz) in DEFAULT_SCHEDULES {
            builder = builder.schedule_in(*name, *expression, *tz);
        }
        for (name, hours) in DEFAULT_GRANULARITIES {
            builder = builder.granularity(*name, *hours);
        }
        builder
    }

    /// Resolves a schedule name.
    pub fn schedule(&self, name: &str) -> Result<&ScheduleSpec, DefinitionError> {
        self.schedules
            .get(name)
            .ok_or_else(|| DefinitionError::UnknownSchedule(name.to_string()))
    }

    /// Resolves a granularity name to its bucket width.
    pub fn granularity(&self, name: &str) -> Result<Granularity, DefinitionError> {
        self.granularities
            .get(name)
            .map(|hours| Granularity::new(name, *hours))
            .ok_or_else(|| DefinitionError::UnsupportedGranularity(name.to_string()))
    }

    pub fn supports(&self, aggregation: Aggregation) -> bool {
        self.aggregations.contains(&aggregation)
    }

    /// True when `granularity` is present with the same width.
    pub fn supports_granularity(&self, granularity: &Granularity) -> bool {
        self.granularities.get(&granularity.name) == Some(&granularity.hours)
    }

    pub fn schedules(&self) -> impl Iterator<Item = &ScheduleSpec> {
        self.schedules.values()
    }

    pub fn granularities(&self) -> impl Iterator<Item = Granularity> + '_ {
        self.granularities
            .iter()
            .map(|(name, hours)| Granularity::new(name.as_str(), *hours))
    }

    pub fn aggregations(&self) -> impl Iterator<Item = Aggregation> + '_ {
        self.aggregations.iter().copied()
    }

    /// Validates one raw record.
    pub fn validate_rule(&self, raw: &RawRuleDefinition) -> Result<RuleDefinition, DefinitionError> {
        RuleDefinition::from_raw(raw, self)
    }

    /// Validates a batch of records, dropping disabled ones.
    ///
    /// Malformed records are logged and returned separately; they never
    /// prevent the remaining rules from loading.
    pub fn validate_rules<'a, I>(&self, records: I) -> ValidatedRules
    where
        I: IntoIterator<Item = &'a RawRuleDefinition>,
    {
        let mut validated = ValidatedRules::default();
        for raw in records.into_iter().filter(|r| r.enabled) {
            match self.validate_rule(raw) {
                Ok(rule) => validated.rules.push(rule),
                Err(error) => {
                    warn!(rule_id = %raw.rule_id, %error, "Skipping malformed rule");
                    metrics::counter!("kpiflow_rules_rejected_total").increment(1);
                    validated.rejected.push((raw.rule_id.clone(), error));
                }
            }
        }
        validated
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog::production()
            .build()
            .expect("built-in schedule table is valid")
    }
}

/// Outcome of validating a batch of raw rules.
#[derive(Debug, Default)]
pub struct ValidatedRules {
    pub rules: Vec<RuleDefinition>,
    pub rejected: Vec<(String, DefinitionError)>,
}

/// Builder for [`Catalog`].
///
/// Entries are collected as given and parsed in [`CatalogBuilder::build`],
/// which reports the first invalid one.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    schedules: BTreeMap<String, (String, String)>,
    granularities: BTreeMap<String, u32>,
    aggregations: BTreeSet<Aggregation>,
}

impl CatalogBuilder {
    /// Adds or replaces a schedule evaluated in UTC.
    pub fn schedule(self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.schedule_in(name, expression, "UTC")
    }

    /// Adds or replaces a schedule evaluated in the given IANA time zone.
    pub fn schedule_in(
        mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        self.schedules
            .insert(name.into(), (expression.into(), timezone.into()));
        self
    }

    /// Adds or replaces a granularity.
    pub fn granularity(mut self, name: impl Into<String>, hours: u32) -> Self {
        self.granularities.insert(name.into(), hours);
        self
    }

    /// Replaces the supported aggregation set.
    pub fn aggregations(mut self, aggregations: impl IntoIterator<Item = Aggregation>) -> Self {
        self.aggregations = aggregations.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<Catalog, DefinitionError> {
        let mut schedules = BTreeMap::new();
        for (name, (expression, timezone)) in self.schedules {
            let spec = ScheduleSpec::parse(&name, &expression, &timezone)?;
            schedules.insert(name, spec);
        }
        if let Some((name, _)) = self.granularities.iter().find(|(_, hours)| **hours == 0) {
            return Err(DefinitionError::UnsupportedGranularity(format!(
                "{} (zero width)",
                name
            )));
        }
        Ok(Catalog {
            schedules,
            granularities: self.granularities,
            aggregations: self.aggregations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_matches_production_tables() {
        let catalog = Catalog::default();
        assert_eq!(catalog.schedules().count(), DEFAULT_SCHEDULES.len());
        assert_eq!(catalog.granularity("2-week").unwrap().hours, 336);
        assert_eq!(catalog.aggregations().count(), 10);
        let et = catalog.schedule("EVERYDAY8AMET").unwrap();
        assert_eq!(et.expression(), "0 8 * * *");
        assert_eq!(et.timezone().name(), "America/New_York");
    }

    #[test]
    fn test_unknown_schedule_lookup_fails() {
        let err = Catalog::default().schedule("EVERYFORTNIGHT").unwrap_err();
        assert_eq!(err, DefinitionError::UnknownSchedule("EVERYFORTNIGHT".into()));
    }

    #[test]
    fn test_invalid_expression_rejected_at_build() {
        let result = Catalog::builder().schedule("BROKEN", "61 * * * *").build();
        assert!(matches!(result, Err(DefinitionError::InvalidSchedule { .. })));
    }

    #[test]
    fn test_invalid_timezone_rejected_at_build() {
        let result = Catalog::builder()
            .schedule_in("LOCAL", "0 * * * *", "Mars/Olympus")
            .build();
        assert!(matches!(result, Err(DefinitionError::InvalidSchedule { .. })));
    }

    #[test]
    fn test_validate_rules_splits_valid_and_rejected() {
        let catalog = Catalog::default();
        let good = RawRuleDefinition::new("ok", "t", "m", "sum", "1-day", "EVERYDAY");
        let bad = RawRuleDefinition::new("bad", "t", "m", "mode", "1-day", "EVERYDAY");
        let mut disabled = good.clone();
        disabled.rule_id = "off".into();
        disabled.enabled = false;

        let validated = catalog.validate_rules([&good, &bad, &disabled]);
        assert_eq!(validated.rules.len(), 1);
        assert_eq!(validated.rules[0].rule_id, "ok");
        assert_eq!(validated.rejected.len(), 1);
        assert_eq!(validated.rejected[0].0, "bad");
    }

    #[test]
    fn test_zero_width_granularity_rejected() {
        assert!(Catalog::builder().granularity("0-hour", 0).build().is_err());
    }
}
