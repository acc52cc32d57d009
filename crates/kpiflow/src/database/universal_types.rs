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

//! Timestamp encoding shared by both database backends.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StoreError;

/// Encodes as `YYYY-MM-DDTHH:MM:SS.ffffffZ`; equal-width strings keep
/// lexical order equal to chronological order.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: value.to_string(),
            reason: e.to_string(),
        })
}

pub fn decode_optional(value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(decode_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_encoding_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (encode_timestamp(early), encode_timestamp(late));
        assert_eq!(a, "2024-01-01T09:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(decode_timestamp(&b).unwrap(), late);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            decode_timestamp("yesterday"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
