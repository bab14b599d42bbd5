//! Configuration source loading and composition

use crate::validation::Validate;
use crate::{ApplicationConfig, ConfigResult};
use std::path::{Path, PathBuf};

/// Trait for loading configuration from different sources
pub trait ConfigurationSource {
    /// Load configuration from this source
    ///
    /// # Errors
    /// Returns configuration loading errors
    fn load(&self) -> ConfigResult<ApplicationConfig>;

    /// Get the name of this configuration source
    fn name(&self) -> &str;

    /// Get the priority of this source (higher number = higher priority)
    fn priority(&self) -> u8;

    /// Whether a load failure aborts startup instead of being skipped
    fn is_required(&self) -> bool {
        false
    }
}

/// Load configuration from environment variables
pub struct EnvironmentSource;

impl ConfigurationSource for EnvironmentSource {
    fn load(&self) -> ConfigResult<ApplicationConfig> {
        Ok(ApplicationConfig::from_env())
    }

    fn name(&self) -> &'static str {
        "environment"
    }

    fn priority(&self) -> u8 {
        10
    }
}

/// Load configuration from a TOML file
pub struct TomlFileSource {
    path: PathBuf,
}

impl TomlFileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigurationSource for TomlFileSource {
    fn load(&self) -> ConfigResult<ApplicationConfig> {
        let content = std::fs::read_to_string(&self.path)?;
        let config: ApplicationConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn name(&self) -> &'static str {
        "toml_file"
    }

    fn priority(&self) -> u8 {
        50
    }

    fn is_required(&self) -> bool {
        true
    }
}

/// Load configuration from a YAML file
pub struct YamlFileSource {
    path: PathBuf,
}

impl YamlFileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigurationSource for YamlFileSource {
    fn load(&self) -> ConfigResult<ApplicationConfig> {
        let content = std::fs::read_to_string(&self.path)?;
        let config: ApplicationConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    fn name(&self) -> &'static str {
        "yaml_file"
    }

    fn priority(&self) -> u8 {
        50
    }

    fn is_required(&self) -> bool {
        true
    }
}

/// Pick a file source from the extension: `.yaml`/`.yml` are YAML, anything else TOML
pub fn file_source<P: AsRef<Path>>(path: P) -> Box<dyn ConfigurationSource> {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => Box::new(YamlFileSource::new(path)),
        _ => Box::new(TomlFileSource::new(path)),
    }
}

/// Type alias for configuration sources
type ConfigSources = Vec<Box<dyn ConfigurationSource>>;

/// Configuration loader that combines multiple sources
pub struct ConfigurationLoader {
    sources: ConfigSources,
}

impl ConfigurationLoader {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigurationSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Load configuration from all sources with priority ordering
    ///
    /// Each successfully loaded source replaces the configuration produced
    /// by lower-priority sources. The file formats carry complete
    /// configurations, so there is no field-level merging.
    ///
    /// # Errors
    /// Returns errors from required sources, or validation errors
    pub fn load(&self) -> ConfigResult<ApplicationConfig> {
        let mut config = ApplicationConfig::from_env();

        let mut sorted_sources = self.sources.iter().collect::<Vec<_>>();
        sorted_sources.sort_by_key(|source| source.priority());

        for source in sorted_sources {
            match source.load() {
                Ok(source_config) => {
                    tracing::debug!("Loaded configuration from source: {}", source.name());
                    config = source_config;
                }
                Err(e) if source.is_required() => {
                    tracing::error!("Failed to load from source {}: {e}", source.name());
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Failed to load from source {}: {e}", source.name());
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_source_replaces_environment() {
        let config = ApplicationConfig::from_env();
        let mut body = toml::to_string(&config).unwrap();
        body = body.replace(
            "max_repo_indexing_job_concurrency = 8",
            "max_repo_indexing_job_concurrency = 2",
        );
        let file = write_temp(".toml", &body);

        let loaded = ConfigurationLoader::new()
            .add_source(Box::new(EnvironmentSource))
            .add_source(file_source(file.path()))
            .load()
            .unwrap();

        assert_eq!(loaded.indexing.max_repo_indexing_job_concurrency, 2);
    }

    #[test]
    fn test_yaml_source_is_selected_by_extension() {
        let config = ApplicationConfig::from_env();
        let body = serde_yaml::to_string(&config).unwrap();
        let file = write_temp(".yml", &body);

        let source = file_source(file.path());
        assert_eq!(source.name(), "yaml_file");
        assert!(source.load().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ConfigurationLoader::new()
            .add_source(Box::new(TomlFileSource::new("/nonexistent/repoweaver.toml")))
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_file_contents_fail_validation() {
        let mut config = ApplicationConfig::from_env();
        config.queue.max_attempts = 0;
        let file = write_temp(".toml", &toml::to_string(&config).unwrap());

        let result = ConfigurationLoader::new()
            .add_source(file_source(file.path()))
            .load();
        assert!(result.is_err());
    }
}
