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

//! Job execution: the worker pool, the retry policy and the query backend
//! seam.

pub mod backend;
pub mod engine;
pub mod retry;
mod slot;

use std::time::Duration;

pub use backend::{DieselQueryBackend, QueryBackend, ResultsSink};
pub use engine::{ExecutionEngine, JobReport, JobRequest, CANCELLED_MESSAGE};
pub use retry::{BackoffStrategy, RetryCondition, RetryPolicy, RetryPolicyBuilder};

/// Execution limits for the worker pool.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Jobs allowed in `running`/`retrying` at once.
    pub max_concurrent_jobs: usize,
    /// Wall-clock budget of one job, retries and backoff included.
    pub job_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Extra attempts at writing a terminal state back to the store.
    pub write_retries: u32,
    pub write_retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            job_timeout: Duration::from_secs(3600),
            retry_policy: RetryPolicy::default(),
            write_retries: 3,
            write_retry_delay: Duration::from_secs(1),
        }
    }
}
