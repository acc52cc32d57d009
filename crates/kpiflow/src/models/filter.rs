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

//! Structured filter predicates.
//!
//! Rules never carry raw SQL. A filter is a small expression tree whose
//! column names are validated identifiers and whose values are always bound
//! as query parameters:
//!
//! ```json
//! {"all": [
//!     {"column": "region", "op": "eq", "value": "us-east"},
//!     {"not": {"column": "host", "op": "in", "value": ["h1", "h2"]}}
//! ]}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;
use crate::query::ident::validate_identifier;

/// Comparison operators available to filter predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    In,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn takes_value(&self) -> bool {
        !matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }
}

/// A literal on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<FilterValue>),
}

/// A boolean expression over the rows of a rule's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterPredicate {
    All {
        all: Vec<FilterPredicate>,
    },
    Any {
        any: Vec<FilterPredicate>,
    },
    Not {
        not: Box<FilterPredicate>,
    },
    Compare {
        column: String,
        op: CompareOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<FilterValue>,
    },
}

impl FilterPredicate {
    /// Shorthand for a single comparison.
    pub fn compare(column: impl Into<String>, op: CompareOp, value: Option<FilterValue>) -> Self {
        FilterPredicate::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    /// Checks identifiers, operator arity and literal types.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self {
            FilterPredicate::All { all: items } | FilterPredicate::Any { any: items } => {
                if items.is_empty() {
                    return Err(DefinitionError::InvalidFilter(
                        "'all'/'any' needs at least one predicate".to_string(),
                    ));
                }
                items.iter().try_for_each(FilterPredicate::validate)
            }
            FilterPredicate::Not { not } => not.validate(),
            FilterPredicate::Compare { column, op, value } => {
                validate_identifier(column)?;
                validate_operand(column, *op, value.as_ref())
            }
        }
    }
}

fn validate_operand(
    column: &str,
    op: CompareOp,
    value: Option<&FilterValue>,
) -> Result<(), DefinitionError> {
    let err = |msg: &str| DefinitionError::InvalidFilter(format!("{} on '{}'", msg, column));

    if !op.takes_value() {
        return match value {
            None => Ok(()),
            Some(_) => Err(err("null checks take no value")),
        };
    }
    let value = value.ok_or_else(|| err("comparison requires a value"))?;

    match (op, value) {
        (CompareOp::In, FilterValue::List(items)) => {
            for item in items {
                if matches!(item, FilterValue::List(_)) {
                    return Err(err("nested lists are not allowed"));
                }
                check_finite(item).map_err(|_| err("non-finite number"))?;
            }
            Ok(())
        }
        (CompareOp::In, _) => Err(err("'in' requires a list")),
        (_, FilterValue::List(_)) => Err(err("only 'in' accepts a list")),
        (CompareOp::Like, FilterValue::Text(_)) => Ok(()),
        (CompareOp::Like, _) => Err(err("'like' requires a string pattern")),
        (_, scalar) => check_finite(scalar).map_err(|_| err("non-finite number")),
    }
}

fn check_finite(value: &FilterValue) -> Result<(), ()> {
    match value {
        FilterValue::Float(f) if !f.is_finite() => Err(()),
        _ => Ok(()),
    }
}
