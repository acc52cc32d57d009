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


use crate::cli::Cli;
use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Level requested by the command line, falling back to the config file.
pub fn resolve_level<'a>(cli: &Cli, config: &'a LoggingConfig) -> &'a str {
    if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        config.level.as_str()
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the resolved level.
///
/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init_logging(cli: &Cli, config: &LoggingConfig) {
    let level = resolve_level(cli, config);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    let _ = match cli.log_format.unwrap_or(config.format) {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
}
