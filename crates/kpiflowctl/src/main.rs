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


mod cli;
mod commands;
mod config;
mod logging;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use config::ConfigLoader;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = ConfigLoader::new().load_config(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }

    logging::init_logging(&cli, &config.logging);

    match &cli.command {
        Commands::Run(args) => commands::run::run(config, args).await?,
        Commands::Validate { file } => commands::rules::validate(&config, file)?,
        Commands::Render {
            file,
            rule_id,
            at,
            dialect,
        } => commands::rules::render(&config, file, rule_id.as_deref(), *at, *dialect)?,
        Commands::Due { file, at } => commands::rules::due(&config, file, *at)?,
        Commands::Import { file } => commands::rules::import(&config, file).await?,
        Commands::Status { limit, status } => {
            commands::jobs::status(&config, *limit, *status).await?
        }
        Commands::Recover { older_than_minutes } => {
            commands::jobs::recover(&config, *older_than_minutes).await?
        }
        Commands::Prune { older_than_days } => {
            commands::jobs::prune(&config, *older_than_days).await?
        }
    }

    Ok(())
}
