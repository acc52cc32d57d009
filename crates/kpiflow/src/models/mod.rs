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

//! Data model shared by every component.
//!
//! - [`rule_definition`]: rule snapshots and their raw input shape
//! - [`filter`]: structured filter predicates attached to rules
//! - [`job_execution`]: one scheduled run of a rule and its state machine

pub mod filter;
pub mod job_execution;
pub mod rule_definition;

pub use filter::{CompareOp, FilterPredicate, FilterValue};
pub use job_execution::{ExecutionResult, JobExecution, JobId, JobStatus};
pub use rule_definition::{Aggregation, Granularity, MetricNames, RawRuleDefinition, RuleDefinition};
