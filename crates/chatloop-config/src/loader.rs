use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chatloop_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_DIR: &str = ".chatloop";
const CONFIG_FILE: &str = "config.yml";

/// Loads `AppConfig` from YAML or TOML, then layers environment overrides on top.
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// `~/.chatloop/config.yml`, or a relative `.chatloop/config.yml` without a home dir.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
            .join(CONFIG_FILE)
    }

    pub fn load(&self) -> Result<AppConfig> {
        if dotenvy::dotenv().is_ok() {
            debug!("loaded environment from .env");
        }

        let mut config = match &self.path {
            Some(path) => Self::read_file(path)?,
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::read_file(&path)?
                } else {
                    info!(
                        "no config file at {}, using defaults",
                        path.display()
                    );
                    AppConfig::default()
                }
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        validate(&config)?;
        Ok(config)
    }

    pub fn read_file(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = parse_config(&raw, path)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

fn parse_config(raw: &str, path: &Path) -> Result<AppConfig> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("toml") => toml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display()))),
        Some("yml") | Some("yaml") | None => serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display()))),
        Some(other) => Err(Error::Config(format!(
            "unsupported config extension '.{other}' (expected .yml, .yaml or .toml)"
        ))),
    }
}

/// Environment wins over file values. `lookup` is injected so tests need not touch the
/// process environment.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = lookup("CHATLOOP_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        config.provider.api_key = Some(key);
    }
    if let Some(base_url) = lookup("CHATLOOP_BASE_URL") {
        config.provider.base_url = base_url;
    }
    if let Some(model) = lookup("CHATLOOP_MODEL") {
        config.provider.model = model;
    }
    if let Some(level) = lookup("CHATLOOP_LOG_LEVEL") {
        config.logging.level = Some(level);
    }
}

pub fn validate(config: &AppConfig) -> Result<()> {
    url::Url::parse(&config.provider.base_url).map_err(|e| {
        Error::Config(format!(
            "provider.base_url '{}' is not a valid URL: {e}",
            config.provider.base_url
        ))
    })?;

    if config.agent.max_rounds == 0 {
        return Err(Error::Config("agent.max_rounds must be at least 1".into()));
    }

    let mut namespaces = HashSet::new();
    for backend in &config.tools {
        let namespace = backend.namespace.trim();
        if namespace.is_empty() {
            return Err(Error::Config("tool backend namespace must not be empty".into()));
        }
        if !namespaces.insert(namespace.to_string()) {
            return Err(Error::Config(format!(
                "duplicate tool backend namespace '{namespace}'"
            )));
        }
        url::Url::parse(&backend.endpoint).map_err(|e| {
            Error::Config(format!(
                "tool backend '{namespace}' endpoint '{}' is invalid: {e}",
                backend.endpoint
            ))
        })?;
        if let Some(stream_endpoint) = &backend.stream_endpoint {
            url::Url::parse(stream_endpoint).map_err(|e| {
                Error::Config(format!(
                    "tool backend '{namespace}' stream_endpoint '{stream_endpoint}' is invalid: {e}"
                ))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolBackendConfig;
    use std::io::Write;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file should be created");
        file.write_all(contents.as_bytes())
            .expect("temp file should be writable");
        file
    }

    #[test]
    fn loads_yaml_with_defaults_for_missing_sections() {
        let file = write_temp(
            ".yml",
            "provider:\n  model: test-model\ntools:\n  - namespace: weather\n    endpoint: http://localhost:9000/rpc\n",
        );

        let config = ConfigLoader::read_file(file.path()).expect("yaml should parse");
        assert_eq!(config.provider.model, "test-model");
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
        assert_eq!(config.agent.max_rounds, 25);
        assert_eq!(config.agent.summary_threshold, 1000);
        assert_eq!(config.agent.tool_idle_timeout_secs, 120);
        assert_eq!(config.agent.persistence_cache_capacity, 1024);
        assert_eq!(config.tools.len(), 1);
        assert_eq!(
            config.tools[0].resolved_stream_endpoint(),
            "http://localhost:9000/rpc/stream"
        );
    }

    #[test]
    fn loads_toml_by_extension() {
        let file = write_temp(
            ".toml",
            "[agent]\nmax_rounds = 5\n\n[[tools]]\nnamespace = \"fs\"\nendpoint = \"http://localhost:1/\"\nstream_endpoint = \"http://localhost:1/events\"\n",
        );

        let config = ConfigLoader::read_file(file.path()).expect("toml should parse");
        assert_eq!(config.agent.max_rounds, 5);
        assert_eq!(
            config.tools[0].resolved_stream_endpoint(),
            "http://localhost:1/events"
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = write_temp(".ini", "x=1");
        let err = ConfigLoader::read_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let loader = ConfigLoader::new(Some(PathBuf::from("/definitely/not/here.yml")));
        assert!(loader.load().is_err());
    }

    #[test]
    fn env_overrides_prefer_chatloop_key() {
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |key| match key {
            "CHATLOOP_API_KEY" => Some("primary".to_string()),
            "OPENAI_API_KEY" => Some("secondary".to_string()),
            "CHATLOOP_MODEL" => Some("override-model".to_string()),
            _ => None,
        });
        assert_eq!(config.provider.api_key.as_deref(), Some("primary"));
        assert_eq!(config.provider.model, "override-model");
    }

    #[test]
    fn env_overrides_fall_back_to_openai_key() {
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |key| match key {
            "OPENAI_API_KEY" => Some("secondary".to_string()),
            _ => None,
        });
        assert_eq!(config.provider.api_key.as_deref(), Some("secondary"));
    }

    #[test]
    fn validate_rejects_duplicate_namespaces() {
        let mut config = AppConfig::default();
        for _ in 0..2 {
            config.tools.push(ToolBackendConfig {
                namespace: "dup".into(),
                endpoint: "http://localhost:1".into(),
                stream_endpoint: None,
                timeout_secs: 5,
            });
        }
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate tool backend namespace"));
    }

    #[test]
    fn validate_rejects_zero_rounds() {
        let mut config = AppConfig::default();
        config.agent.max_rounds = 0;
        assert!(validate(&config).is_err());
    }
}
