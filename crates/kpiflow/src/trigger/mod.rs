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

//! Trigger engine: which rules are due at a given minute.
//!
//! Evaluation is a pure function of `(now, rules, last_fired)`. The engine
//! never reads the clock, so every decision can be reproduced in tests by
//! passing the instant explicitly.

pub mod schedule;

use chrono::{DateTime, Duration, DurationRound, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::DefinitionError;
use crate::models::RuleDefinition;

pub use schedule::ScheduleSpec;

/// Truncates an instant to the start of its minute.
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(instant)
}

/// The minutes a tick at `now` must evaluate.
///
/// Every whole minute in `(last_evaluated, now]` is returned in ascending
/// order, keeping only the most recent `max_catchup` of them. Without a
/// previous evaluation only the current minute is returned.
pub fn minutes_to_evaluate(
    last_evaluated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_catchup: u32,
) -> Vec<DateTime<Utc>> {
    let current = truncate_to_minute(now);
    let Some(last) = last_evaluated.map(truncate_to_minute) else {
        return vec![current];
    };
    if last >= current {
        return Vec::new();
    }

    let missed = (current - last).num_minutes();
    let keep = missed.min(i64::from(max_catchup.max(1)));
    (0..keep)
        .rev()
        .map(|back| current - Duration::minutes(back))
        .collect()
}

/// Result of evaluating a rule set at one instant.
#[derive(Debug, Default)]
pub struct DueRules {
    /// The minute that was evaluated.
    pub instant: Option<DateTime<Utc>>,
    pub due: BTreeSet<String>,
    /// Rules that could not be evaluated, with the reason.
    pub rejected: Vec<(String, DefinitionError)>,
}

/// Decides which rules are due.
#[derive(Debug, Clone)]
pub struct TriggerEngine {
    catalog: Arc<Catalog>,
}

impl TriggerEngine {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Whether `rule` is due at `now`.
    ///
    /// A rule is due when the minute of `now` matches its recurrence and
    /// `last_fired` is not that same minute.
    pub fn is_due(
        &self,
        now: DateTime<Utc>,
        rule: &RuleDefinition,
        last_fired: Option<DateTime<Utc>>,
    ) -> Result<bool, DefinitionError> {
        let spec = self.catalog.schedule(&rule.schedule_name)?;
        let instant = truncate_to_minute(now);
        if !spec.matches(instant) {
            return Ok(false);
        }
        Ok(last_fired.map(truncate_to_minute) != Some(instant))
    }

    /// Evaluates every rule at `now`.
    ///
    /// A rule with an unmapped schedule is reported in
    /// [`DueRules::rejected`] and does not affect the others.
    pub fn due_rules(
        &self,
        now: DateTime<Utc>,
        rules: &[RuleDefinition],
        last_fired: &HashMap<String, DateTime<Utc>>,
    ) -> DueRules {
        let mut result = DueRules {
            instant: Some(truncate_to_minute(now)),
            ..DueRules::default()
        };
        for rule in rules {
            match self.is_due(now, rule, last_fired.get(&rule.rule_id).copied()) {
                Ok(true) => {
                    result.due.insert(rule.rule_id.clone());
                }
                Ok(false) => {}
                Err(error) => result.rejected.push((rule.rule_id.clone(), error)),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawRuleDefinition;
    use chrono::TimeZone;

    fn engine() -> TriggerEngine {
        TriggerEngine::new(Arc::new(Catalog::default()))
    }

    fn rule(id: &str, schedule: &str) -> RuleDefinition {
        let raw = RawRuleDefinition::new(id, "du_metrics", "cpu_usage", "avg", "1-hour", schedule);
        RuleDefinition::from_raw(&raw, &Catalog::default()).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_hourly_rule_due_at_nine() {
        assert!(engine().is_due(at(9, 0), &rule("r1", "EVERYHOUR"), None).unwrap());
    }

    #[test]
    fn test_hourly_rule_not_due_at_nine_thirty_one() {
        assert!(!engine().is_due(at(9, 31), &rule("r1", "EVERYHOUR"), None).unwrap());
    }

    #[test]
    fn test_rule_not_due_again_for_same_instant() {
        let r = rule("r1", "EVERYHOUR");
        let engine = engine();
        let now = at(9, 0);
        assert!(engine.is_due(now, &r, None).unwrap());
        assert!(!engine.is_due(now, &r, Some(now)).unwrap());
        // Later in the same minute is still the same instant.
        let later = now + Duration::seconds(20);
        assert!(!engine.is_due(later, &r, Some(now)).unwrap());
        // The previous hour's firing does not block this one.
        assert!(engine.is_due(now, &r, Some(at(8, 0))).unwrap());
    }

    #[test]
    fn test_unknown_schedule_is_rejected_without_affecting_others() {
        let rules = vec![rule("good", "EVERYHOUR"), rule("bad", "EVERYFORTNIGHT")];
        let result = engine().due_rules(at(9, 0), &rules, &HashMap::new());
        assert_eq!(result.due, BTreeSet::from(["good".to_string()]));
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(
            result.rejected[0].1,
            DefinitionError::UnknownSchedule("EVERYFORTNIGHT".into())
        );
    }

    #[test]
    fn test_due_rules_is_pure() {
        let rules = vec![
            rule("a", "EVERYHOUR"),
            rule("b", "EVERY15MINUTES"),
            rule("c", "EVERYHOURBYMIN10"),
        ];
        let mut fired = HashMap::new();
        fired.insert("b".to_string(), at(9, 0));
        let engine = engine();
        let first = engine.due_rules(at(9, 0), &rules, &fired);
        let second = engine.due_rules(at(9, 0), &rules, &fired);
        assert_eq!(first.due, second.due);
        assert_eq!(first.due, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn test_first_tick_evaluates_current_minute_only() {
        let now = at(9, 0) + Duration::seconds(30);
        assert_eq!(minutes_to_evaluate(None, now, 5), vec![at(9, 0)]);
    }

    #[test]
    fn test_delayed_tick_catches_up_missed_minutes() {
        let minutes = minutes_to_evaluate(Some(at(8, 58)), at(9, 1), 5);
        assert_eq!(minutes, vec![at(8, 59), at(9, 0), at(9, 1)]);
    }

    #[test]
    fn test_catch_up_is_capped() {
        let minutes = minutes_to_evaluate(Some(at(8, 0)), at(9, 0), 2);
        assert_eq!(minutes, vec![at(8, 59), at(9, 0)]);
    }

    #[test]
    fn test_sub_minute_tick_evaluates_nothing_new() {
        let minutes = minutes_to_evaluate(Some(at(9, 0)), at(9, 0) + Duration::seconds(40), 5);
        assert!(minutes.is_empty());
    }
}
