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

//! Identifier validation and quoting.
//!
//! Table and column names come from rule definitions, which are untrusted.
//! They must match `[A-Za-z_][A-Za-z0-9_]*` (at most 63 characters, the
//! PostgreSQL limit) and are always emitted double-quoted.

use crate::error::DefinitionError;

/// Maximum identifier length (PostgreSQL NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validates a single table or column name.
pub fn validate_identifier(name: &str) -> Result<&str, DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidIdentifier {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid("must be 1-63 characters"));
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return Err(invalid("must start with a letter or underscore")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid("only letters, digits and underscore are allowed"));
    }
    Ok(name)
}

/// Validates `table` or `schema.table`.
pub fn validate_table_name(name: &str) -> Result<&str, DefinitionError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(DefinitionError::InvalidIdentifier {
            name: name.to_string(),
            reason: "at most one schema qualifier is allowed".to_string(),
        });
    }
    for part in parts {
        validate_identifier(part)?;
    }
    Ok(name)
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes each dotted part of a table name separately.
pub fn quote_table_name(name: &str) -> String {
    name.split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}
