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

//! Parametrized SQL assembly.
//!
//! [`SqlBuilder`] accumulates two renderings at once: the statement with
//! dialect placeholders plus its bound values, and a display rendering with
//! escaped literals inlined. Rule-supplied values only ever enter through
//! [`SqlBuilder::push_param`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::models::JobId;
use crate::query::dialect::Dialect;
use crate::query::ident::{quote_identifier, quote_table_name};

/// A value bound to a query placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Renders the value as an escaped SQL literal.
    pub fn to_literal(&self, dialect: Dialect) -> String {
        match self {
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Float(f) if f.is_finite() => f.to_string(),
            SqlValue::Float(_) => "NULL".to_string(),
            SqlValue::Bool(true) => "TRUE".to_string(),
            SqlValue::Bool(false) => "FALSE".to_string(),
            SqlValue::Timestamp(ts) => dialect.timestamp_literal(*ts),
        }
    }
}

/// A generated query: parametrized text, bound values and inline rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedQuery {
    pub dialect: Dialect,
    /// Statement text with placeholders.
    pub sql: String,
    /// Values for the placeholders, in order.
    pub params: Vec<SqlValue>,
    /// Aggregate output columns, in select order.
    pub outputs: Vec<String>,
    /// Job the query was generated for.
    pub job_id: Option<JobId>,
    inline: String,
}

impl GeneratedQuery {
    /// The statement with every parameter inlined as an escaped literal.
    ///
    /// Used for audit records and for backends without bind support.
    pub fn inline(&self) -> &str {
        &self.inline
    }
}

impl fmt::Display for GeneratedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

#[derive(Debug)]
pub(crate) struct SqlBuilder {
    dialect: Dialect,
    sql: String,
    inline: String,
    params: Vec<SqlValue>,
    outputs: Vec<String>,
}

impl SqlBuilder {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            inline: String::new(),
            params: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Appends trusted SQL text.
    pub(crate) fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self.inline.push_str(text);
        self
    }

    /// Appends a quoted column name. Callers validate it first.
    pub(crate) fn push_identifier(&mut self, name: &str) -> &mut Self {
        self.push(&quote_identifier(name))
    }

    pub(crate) fn push_table(&mut self, name: &str) -> &mut Self {
        self.push(&quote_table_name(name))
    }

    pub(crate) fn push_param(&mut self, value: SqlValue) -> &mut Self {
        let placeholder = self.dialect.placeholder(self.params.len() + 1);
        self.sql.push_str(&placeholder);
        self.inline.push_str(&value.to_literal(self.dialect));
        self.params.push(value);
        self
    }

    /// Appends `expr AS "alias"` and records `alias` as an output column.
    pub(crate) fn push_output(&mut self, expr: &str, alias: &str) -> &mut Self {
        self.push(expr).push(" AS ").push_identifier(alias);
        self.outputs.push(alias.to_string());
        self
    }

    pub(crate) fn finish(self) -> GeneratedQuery {
        GeneratedQuery {
            dialect: self.dialect,
            sql: self.sql,
            params: self.params,
            outputs: self.outputs,
            job_id: None,
            inline: self.inline,
        }
    }
}
