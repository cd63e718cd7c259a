use crate::domain::types::ToolRegistryEntry;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "meta-llama/llama-4-maverick-17b-128e-instruct";
const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_CONFIG_PATH: &str = "config/udyamitra.toml";
const DEFAULT_REGISTRY_PATH: &str = "config/tool_registry.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read tool registry from {path:?}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse tool registry from {path:?}: {source}")]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("tool registry at {path:?} is empty; register tools before starting")]
    EmptyRegistry { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub llm_base_url: String,
    pub registry_path: PathBuf,
    /// Turn cap for the interactive eligibility loop.
    pub max_eligibility_turns: usize,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    llm_base_url: Option<String>,
    registry_path: Option<PathBuf>,
    max_eligibility_turns: Option<usize>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            max_eligibility_turns: crate::application::eligibility::DEFAULT_MAX_TURNS,
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let defaults = AppConfig::default();
    Ok(AppConfig {
        model: parsed.model.unwrap_or(defaults.model),
        llm_base_url: parsed.llm_base_url.unwrap_or(defaults.llm_base_url),
        registry_path: parsed.registry_path.unwrap_or(defaults.registry_path),
        max_eligibility_turns: parsed
            .max_eligibility_turns
            .unwrap_or(defaults.max_eligibility_turns),
    })
}

/// Static tool catalogue, loaded once at startup and read-only during
/// execution. New entries are appended only through [`ToolRegistry::register`]
/// followed by an explicit save. Keyed by tool name in a `BTreeMap` so
/// iteration order is stable across runs.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolRegistryEntry>,
}

impl ToolRegistry {
    /// Loads the registry file. An empty registry is a startup error: the
    /// orchestrator has nothing to route to.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::RegistryIo {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: BTreeMap<String, ToolRegistryEntry> = serde_json::from_str(&content)
            .map_err(|source| ConfigError::RegistryParse {
                path: path.to_path_buf(),
                source,
            })?;
        if entries.is_empty() {
            return Err(ConfigError::EmptyRegistry {
                path: path.to_path_buf(),
            });
        }
        info!(count = entries.len(), path = %path.display(), "Loaded tool registry");
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<ToolRegistryEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.tool_name.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, tool_name: &str) -> Option<&ToolRegistryEntry> {
        self.entries.get(tool_name)
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.entries.contains_key(tool_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolRegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registration step: appends or replaces an entry. Not a runtime
    /// execution path; callers persist with [`ToolRegistry::save`].
    pub fn register(&mut self, entry: ToolRegistryEntry) {
        info!(tool = %entry.tool_name, endpoint = %entry.endpoint, "Registering tool");
        self.entries.insert(entry.tool_name.clone(), entry);
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self.entries).map_err(|source| {
            ConfigError::RegistryParse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        fs::write(path, content).map_err(|source| ConfigError::RegistryIo {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Saved tool registry");
        Ok(())
    }
}
