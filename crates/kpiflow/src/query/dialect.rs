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

//! SQL dialect differences the generator has to template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::Aggregation;

/// Target SQL dialect for generated queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL: `$n` placeholders, ordered-set aggregates.
    #[default]
    Postgres,
    /// Presto / Trino: `?` placeholders, `min_by`/`max_by`.
    Presto,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Presto => "presto",
        }
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Presto => "?".to_string(),
        }
    }

    pub fn timestamp_literal(&self, ts: DateTime<Utc>) -> String {
        match self {
            Dialect::Postgres => format!("TIMESTAMPTZ '{}'", ts.format("%Y-%m-%d %H:%M:%S+00")),
            Dialect::Presto => format!("TIMESTAMP '{} UTC'", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }

    /// Expression truncating quoted column `ts` to buckets of `hours`.
    ///
    /// Hour, day and week widths use `date_trunc`; any other width floors
    /// the epoch to a multiple of the bucket size.
    pub fn bucket_expression(&self, ts: &str, hours: u32) -> String {
        let unit = match hours {
            1 => Some("hour"),
            24 => Some("day"),
            168 => Some("week"),
            _ => None,
        };
        if let Some(unit) = unit {
            return format!("date_trunc('{}', {})", unit, ts);
        }
        let seconds = u64::from(hours) * 3600;
        match self {
            Dialect::Postgres => format!(
                "to_timestamp(floor(extract(epoch from {ts}) / {s}) * {s})",
                ts = ts,
                s = seconds
            ),
            Dialect::Presto => format!(
                "from_unixtime(floor(to_unixtime({ts}) / {s}) * {s})",
                ts = ts,
                s = seconds
            ),
        }
    }

    /// Aggregate expression over quoted `metric`, ordered by quoted `ts`
    /// where the aggregation is order sensitive.
    pub fn aggregate_expression(&self, aggregation: Aggregation, metric: &str, ts: &str) -> String {
        use Aggregation::*;
        match (self, aggregation) {
            (_, Sum) => format!("sum({})", metric),
            (_, Avg) => format!("avg({})", metric),
            (_, Count) => format!("count({})", metric),
            (_, Min) => format!("min({})", metric),
            (_, Max) => format!("max({})", metric),
            (Dialect::Postgres, Median) => {
                format!("percentile_cont(0.5) WITHIN GROUP (ORDER BY {})", metric)
            }
            (Dialect::Presto, Median) => format!("approx_percentile({}, 0.5)", metric),
            (Dialect::Postgres, Std) => format!("stddev_samp({})", metric),
            (Dialect::Presto, Std) => format!("stddev({})", metric),
            (Dialect::Postgres, Var) => format!("var_samp({})", metric),
            (Dialect::Presto, Var) => format!("variance({})", metric),
            (Dialect::Postgres, First) => format!("(array_agg({} ORDER BY {} ASC))[1]", metric, ts),
            (Dialect::Presto, First) => format!("min_by({}, {})", metric, ts),
            (Dialect::Postgres, Last) => format!("(array_agg({} ORDER BY {} DESC))[1]", metric, ts),
            (Dialect::Presto, Last) => format!("max_by({}, {})", metric, ts),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "presto" | "trino" | "watsonx" => Ok(Dialect::Presto),
            other => Err(format!("unknown SQL dialect '{}'", other)),
        }
    }
}
