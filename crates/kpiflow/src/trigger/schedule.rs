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

//! Five-field cron recurrences bound to a time zone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use std::fmt;

use crate::error::DefinitionError;
use crate::trigger::truncate_to_minute;

/// A parsed recurrence: `minute hour day-of-month month day-of-week`,
/// evaluated in `timezone`.
#[derive(Clone)]
pub struct ScheduleSpec {
    name: String,
    expression: String,
    timezone: Tz,
    cron: Cron,
}

impl ScheduleSpec {
    pub fn parse(name: &str, expression: &str, timezone: &str) -> Result<Self, DefinitionError> {
        let invalid = |reason: String| DefinitionError::InvalidSchedule {
            name: name.to_string(),
            reason,
        };

        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(invalid(format!(
                "expected 5 cron fields, found {} in '{}'",
                fields, expression
            )));
        }
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| invalid(format!("'{}': {}", expression, e)))?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| invalid(format!("time zone '{}': {}", timezone, e)))?;

        Ok(Self {
            name: name.to_string(),
            expression: expression.to_string(),
            timezone,
            cron,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// True when the minute containing `instant` matches the recurrence.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        let local = truncate_to_minute(instant).with_timezone(&self.timezone);
        self.cron.is_time_matching(&local).unwrap_or(false)
    }

    /// The first matching minute strictly after `instant`.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = truncate_to_minute(instant).with_timezone(&self.timezone);
        self.cron
            .find_next_occurrence(&local, false)
            .ok()
            .map(|next| next.with_timezone(&Utc))
    }
}

impl fmt::Debug for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleSpec")
            .field("name", &self.name)
            .field("expression", &self.expression)
            .field("timezone", &self.timezone)
            .finish()
    }
}
