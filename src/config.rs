//! Configuration for shipyard.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SHIPYARD_HOME, SHIPYARD_SERVICES, SHIPYARD_USER)
//! 2. Config file (.shipyard/config.yaml)
//! 3. Defaults (~/.shipyard, ./services)
//!
//! Config file discovery:
//! - Searches current directory and parents for .shipyard/config.yaml
//! - `paths.home` is relative to the .shipyard/ directory, every other path
//!   to the project root (the parent of .shipyard/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{default_exclude, BatchOptions, PollPolicy};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub environments: Option<Vec<String>>,
    #[serde(default)]
    pub default_environment: Option<String>,
    #[serde(default)]
    pub build: PollConfig,
    #[serde(default)]
    pub rollout: PollConfig,
    #[serde(default)]
    pub batch: BatchOptions,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .shipyard/)
    pub home: Option<String>,
    /// Services directory (relative to the project root)
    pub services: Option<String>,
}

/// Polling schedule as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_initial_interval() -> u64 {
    2000
}
fn default_max_interval() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_timeout_seconds() -> u64 {
    600
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl From<PollConfig> for PollPolicy {
    fn from(config: PollConfig) -> Self {
        Self {
            initial_interval_ms: config.initial_interval_ms,
            max_interval_ms: config.max_interval_ms,
            backoff_multiplier: config.backoff_multiplier,
            timeout_ms: config.timeout_seconds.saturating_mul(1000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

/// Shell commands backing the process adapters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    pub build_command: Option<String>,
    pub deploy_command: Option<String>,
}

/// Values read from the environment
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<PathBuf>,
    services: Option<PathBuf>,
    user: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            home: var("SHIPYARD_HOME").map(PathBuf::from),
            services: var("SHIPYARD_SERVICES").map(PathBuf::from),
            user: var("SHIPYARD_USER").or_else(|| var("USER")),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory (history, artifact index, runtime state)
    pub home: PathBuf,
    /// Directory with one subdirectory per service
    pub services: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub environments: Vec<String>,
    pub default_environment: String,
    pub build: PollConfig,
    pub rollout: PollConfig,
    pub batch: BatchOptions,
    pub exclude: Vec<String>,
    pub adapters: AdaptersConfig,
    /// Recorded as `deployed_by`
    pub user: Option<String>,
}

impl ResolvedConfig {
    /// $SHIPYARD_HOME/history
    pub fn history_dir(&self) -> PathBuf {
        self.home.join("history")
    }

    /// $SHIPYARD_HOME/artifacts
    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("artifacts")
    }

    /// $SHIPYARD_HOME/runtime
    pub fn runtime_dir(&self) -> PathBuf {
        self.home.join("runtime")
    }
}

fn default_environments() -> Vec<String> {
    ["production", "staging", "dev"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".shipyard").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine the config file (if any), environment and defaults
fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: EnvOverrides,
    default_home: PathBuf,
    cwd: &Path,
) -> ResolvedConfig {
    let Some((config_path, config)) = file else {
        return ResolvedConfig {
            home: env.home.unwrap_or(default_home),
            services: env.services.unwrap_or_else(|| cwd.join("services")),
            config_file: None,
            environments: default_environments(),
            default_environment: "production".to_string(),
            build: PollConfig::default(),
            rollout: PollConfig::default(),
            batch: BatchOptions::default(),
            exclude: default_exclude(),
            adapters: AdaptersConfig::default(),
            user: env.user,
        };
    };

    // .shipyard/ and the project root above it
    let shipyard_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = shipyard_dir.parent().unwrap_or(Path::new("."));

    let home = env.home.unwrap_or_else(|| match config.paths.home.as_deref() {
        Some(home) => resolve_path(shipyard_dir, home),
        None => default_home,
    });

    let services = env.services.unwrap_or_else(|| match config.paths.services.as_deref() {
        Some(services) => resolve_path(base_dir, services),
        None => base_dir.join("services"),
    });

    let environments = config
        .environments
        .filter(|e| !e.is_empty())
        .unwrap_or_else(default_environments);
    let default_environment = config
        .default_environment
        .or_else(|| environments.first().cloned())
        .unwrap_or_else(|| "production".to_string());

    ResolvedConfig {
        home,
        services,
        config_file: Some(config_path),
        environments,
        default_environment,
        build: config.build,
        rollout: config.rollout,
        batch: config.batch,
        exclude: config.fingerprint.exclude,
        adapters: config.adapters,
        user: env.user,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".shipyard");
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    let file = match find_config_file(&cwd) {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(file, EnvOverrides::from_env(), default_home, &cwd))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
