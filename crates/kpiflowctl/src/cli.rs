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


use crate::config::{LogFormat, SchedulerSettings};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use kpiflow::{Dialect, JobStatus};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "kpiflowctl",
    version,
    about = "Operate the kpiflow KPI rule scheduler",
    long_about = "Runs the kpiflow scheduler against a rule store and offers offline tooling \
                  for validating rule files, rendering their queries, and inspecting job history"
)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "KPIFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Rule store database URL, overrides [database].url
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format, overrides [logging].format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run(RunArgs),

    /// Check a rules file against the catalog
    Validate {
        /// JSON array of rule definitions
        file: PathBuf,
    },

    /// Print the query each rule would run at an instant
    Render {
        /// JSON array of rule definitions
        file: PathBuf,

        /// Only render this rule
        #[arg(long)]
        rule_id: Option<String>,

        /// Due instant (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// SQL dialect, overrides [backend].dialect
        #[arg(long)]
        dialect: Option<Dialect>,
    },

    /// List the rules due at an instant
    Due {
        /// JSON array of rule definitions
        file: PathBuf,

        /// Instant to evaluate (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Upsert a rules file into the rule store
    Import {
        /// JSON array of rule definitions
        file: PathBuf,
    },

    /// Show job counts and the most recent executions
    Status {
        /// Number of executions to list
        #[arg(long, default_value_t = 20)]
        limit: i64,

        /// Only list executions in this state
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Fail jobs left pending or running by a dead process
    Recover {
        /// Age after which a live job counts as abandoned, defaults to the
        /// configured stale job threshold
        #[arg(long)]
        older_than_minutes: Option<u64>,
    },

    /// Delete finished executions older than the retention window
    Prune {
        /// Retention in days, defaults to [scheduler].result_retention_days
        #[arg(long)]
        older_than_days: Option<u64>,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Evaluate a single tick, wait for its jobs, and exit
    #[arg(long)]
    pub once: bool,

    /// Instant evaluated by --once (RFC 3339), defaults to now
    #[arg(long, requires = "once")]
    pub at: Option<DateTime<Utc>>,

    /// Seconds between scheduler ticks
    #[arg(long, env = "SCHEDULER_CHECK_INTERVAL")]
    pub check_interval: Option<u64>,

    /// Jobs allowed to run at the same time
    #[arg(long, env = "MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    /// Seconds a job may run across all attempts
    #[arg(long, env = "JOB_TIMEOUT")]
    pub job_timeout: Option<u64>,

    /// Backend attempts per job, the first one included
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Seconds between attempts
    #[arg(long, env = "RETRY_DELAY")]
    pub retry_delay: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "KPIFLOW_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl RunArgs {
    /// Applies command-line and environment overrides to the file settings.
    pub fn apply(&self, settings: &mut SchedulerSettings) {
        if let Some(value) = self.check_interval {
            settings.check_interval_secs = value;
        }
        if let Some(value) = self.max_concurrent_jobs {
            settings.max_concurrent_jobs = value;
        }
        if let Some(value) = self.job_timeout {
            settings.job_timeout_secs = value;
        }
        if let Some(value) = self.max_retries {
            settings.max_retries = value;
        }
        if let Some(value) = self.retry_delay {
            settings.retry_delay_secs = value;
        }
    }
}
