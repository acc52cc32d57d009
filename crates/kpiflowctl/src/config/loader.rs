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


use crate::config::{ConfigError, KpiflowConfig};
use regex::Regex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming a configuration file.
pub const CONFIG_ENV_VAR: &str = "KPIFLOW_CONFIG";

pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Loader searching the working directory, the user config directory,
    /// then `/etc/kpiflow`.
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("./kpiflow.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("kpiflow").join("config.toml"));
        }

        search_paths.push(PathBuf::from("/etc/kpiflow/config.toml"));

        Self { search_paths }
    }

    #[cfg(test)]
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Loads the given file, the file named by `KPIFLOW_CONFIG`, or the first
    /// file found on the search path.
    ///
    /// An explicitly named file must exist. When nothing is named and no file
    /// is found the built-in defaults are returned.
    pub fn load_config(&self, config_file: Option<&Path>) -> Result<KpiflowConfig, ConfigError> {
        let config_path = if let Some(path) = config_file {
            Some(path.to_path_buf())
        } else if let Ok(env_config) = env::var(CONFIG_ENV_VAR) {
            Some(PathBuf::from(env_config))
        } else {
            self.find_config_file()
        };

        match config_path {
            Some(path) => {
                debug!(path = %path.display(), "Loading configuration");
                self.load_config_from_file(&path)
            }
            None => {
                debug!("No configuration file found, using defaults");
                Ok(KpiflowConfig::default())
            }
        }
    }

    pub fn load_config_from_file(&self, path: &Path) -> Result<KpiflowConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") | None => self.parse(&content),
            Some(ext) => Err(ConfigError::UnsupportedFormat {
                extension: ext.to_string(),
            }),
        }
    }

    /// Parses TOML content after environment substitution.
    pub fn parse(&self, content: &str) -> Result<KpiflowConfig, ConfigError> {
        let substituted = self.substitute_env_vars(content)?;
        Ok(toml::from_str::<KpiflowConfig>(&substituted)?)
    }

    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .find(|path| path.is_file())
            .cloned()
    }

    /// Expands `${VAR}`, `${VAR:-default}` and `${VAR:?message}`.
    fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::EnvSubstitutionError(e.to_string()))?;
        let mut result = String::with_capacity(content.len());
        let mut last = 0;

        for cap in re.captures_iter(content) {
            let Some(full_match) = cap.get(0) else {
                continue;
            };
            result.push_str(&content[last..full_match.start()]);
            result.push_str(&self.process_var_expression(&cap[1])?);
            last = full_match.end();
        }
        result.push_str(&content[last..]);

        Ok(result)
    }

    fn process_var_expression(&self, expr: &str) -> Result<String, ConfigError> {
        if let Some((var_name, default_value)) = expr.split_once(":-") {
            Ok(env::var(var_name).unwrap_or_else(|_| default_value.to_string()))
        } else if let Some((var_name, error_msg)) = expr.split_once(":?") {
            env::var(var_name).map_err(|_| {
                ConfigError::EnvSubstitutionError(format!(
                    "Required environment variable '{}' is not set: {}",
                    var_name, error_msg
                ))
            })
        } else {
            env::var(expr).map_err(|_| {
                ConfigError::EnvSubstitutionError(format!(
                    "Required environment variable '{}' is not set",
                    expr
                ))
            })
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_env_substitution_with_default() {
        let loader = ConfigLoader::new();
        env::remove_var("KPIFLOW_TEST_DB");

        let content = "url = \"${KPIFLOW_TEST_DB:-postgresql://localhost/kpi}\"";
        let result = loader.substitute_env_vars(content).unwrap();
        assert_eq!(result, "url = \"postgresql://localhost/kpi\"");
    }

    #[test]
    #[serial]
    fn test_env_substitution_with_existing_var() {
        let loader = ConfigLoader::new();
        env::set_var("KPIFLOW_TEST_DB", "sqlite://custom.db");

        let content = "url = \"${KPIFLOW_TEST_DB:-postgresql://localhost/kpi}\"";
        let result = loader.substitute_env_vars(content).unwrap();
        assert_eq!(result, "url = \"sqlite://custom.db\"");

        env::remove_var("KPIFLOW_TEST_DB");
    }

    #[test]
    #[serial]
    fn test_env_substitution_repeated_variable() {
        let loader = ConfigLoader::new();
        env::set_var("KPIFLOW_TEST_HOST", "db1");

        let content = "a = \"${KPIFLOW_TEST_HOST}\"\nb = \"${KPIFLOW_TEST_HOST}\"";
        let result = loader.substitute_env_vars(content).unwrap();
        assert_eq!(result, "a = \"db1\"\nb = \"db1\"");

        env::remove_var("KPIFLOW_TEST_HOST");
    }

    #[test]
    #[serial]
    fn test_env_substitution_required_var_missing() {
        let loader = ConfigLoader::new();
        env::remove_var("KPIFLOW_REQUIRED");

        let result = loader.substitute_env_vars("url = \"${KPIFLOW_REQUIRED}\"");
        assert!(matches!(result, Err(ConfigError::EnvSubstitutionError(_))));
    }

    #[test]
    #[serial]
    fn test_env_substitution_custom_error() {
        let loader = ConfigLoader::new();
        env::remove_var("KPIFLOW_REQUIRED");

        let content = "url = \"${KPIFLOW_REQUIRED:?database URL must be provided}\"";
        let err = loader.substitute_env_vars(content).unwrap_err();
        assert!(err.to_string().contains("database URL must be provided"));
    }

    #[test]
    #[serial]
    fn test_missing_search_paths_fall_back_to_defaults() {
        env::remove_var(CONFIG_ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_search_paths(vec![dir.path().join("kpiflow.toml")]);

        let config = loader.load_config(None).unwrap();
        assert_eq!(config, KpiflowConfig::default());
    }

    #[test]
    #[serial]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_search_paths(vec![]);

        let result = loader.load_config(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    #[serial]
    fn test_search_path_file_is_loaded() {
        env::remove_var(CONFIG_ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kpiflow.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[scheduler]\nmax_concurrent_jobs = 4").unwrap();

        let loader = ConfigLoader::with_search_paths(vec![path]);
        let config = loader.load_config(None).unwrap();
        assert_eq!(config.scheduler.max_concurrent_jobs, 4);
    }

    #[test]
    #[serial]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kpiflow.yaml");
        fs::write(&path, "scheduler: {}").unwrap();

        let loader = ConfigLoader::with_search_paths(vec![]);
        let result = loader.load_config(Some(&path));
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedFormat { ref extension }) if extension == "yaml"
        ));
    }
}
