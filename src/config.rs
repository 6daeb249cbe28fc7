//! Configuration for stagetrack.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STAGETRACK_STATES_ROOT, STAGETRACK_TAG_PREFIX,
//!    STAGETRACK_LOG_FILE)
//! 2. Config file (.stagetrack/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .stagetrack/config.yaml
//! - Paths in config file are relative to the directory holding .stagetrack/

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::demux::DEFAULT_TAG_PREFIX;
use crate::core::filter::{default_job_patterns, default_patterns};
use crate::core::monitor::default_orchestration_functions;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".stagetrack";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RendererConfig {
    pub salt_call: Option<String>,
    pub salt: Option<String>,
    /// State tree root (relative to the project root)
    pub states_root: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusConfig {
    /// Command printing bus events, one per line
    pub command: Option<String>,
    pub tag_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorConfig {
    pub ignore_functions: Option<Vec<String>>,
    pub ignore_job_functions: Option<Vec<String>>,
    pub orchestration_functions: Option<Vec<String>>,
    pub show_state_steps: Option<bool>,
    pub only_visible_steps: Option<bool>,
    pub show_dynamic_steps: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub file: Option<String>,
    pub level: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub renderer: RendererSettings,
    pub bus: BusSettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct RendererSettings {
    pub salt_call: String,
    pub salt: String,
    pub states_root: PathBuf,
    pub timeout_seconds: u64,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            salt_call: "salt-call".to_string(),
            salt: "salt".to_string(),
            states_root: PathBuf::from("/srv/salt"),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusSettings {
    pub command: String,
    pub tag_prefix: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            command: "salt-run state.event pretty=False".to_string(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSettings {
    pub ignore_functions: Vec<String>,

    /// Ignored on node jobs only
    pub ignore_job_functions: Vec<String>,
    pub orchestration_functions: Vec<String>,
    pub show_state_steps: bool,
    pub only_visible_steps: bool,

    /// Track dispatches that match no compiled step
    pub show_dynamic_steps: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            ignore_functions: default_patterns(),
            ignore_job_functions: default_job_patterns(),
            orchestration_functions: default_orchestration_functions(),
            show_state_steps: true,
            only_visible_steps: false,
            show_dynamic_steps: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingSettings {
    /// Log file; `None` logs to stderr
    pub file: Option<PathBuf>,
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file: dirs::home_dir().map(|home| home.join(CONFIG_DIR).join("stagetrack.log")),
            level: "info".to_string(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
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

/// Resolve a path that may be relative to the project root
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

/// Merge a parsed config file over the defaults
fn resolve(config: ConfigFile, config_file: Option<PathBuf>) -> ResolvedConfig {
    // Base directory is the parent of .stagetrack/ (i.e., grandparent of config.yaml)
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let renderer_defaults = RendererSettings::default();
    let renderer = RendererSettings {
        salt_call: config.renderer.salt_call.unwrap_or(renderer_defaults.salt_call),
        salt: config.renderer.salt.unwrap_or(renderer_defaults.salt),
        states_root: config
            .renderer
            .states_root
            .map(|p| resolve_path(&base_dir, &p))
            .unwrap_or(renderer_defaults.states_root),
        timeout_seconds: config
            .renderer
            .timeout_seconds
            .unwrap_or(renderer_defaults.timeout_seconds),
    };

    let bus_defaults = BusSettings::default();
    let bus = BusSettings {
        command: config.bus.command.unwrap_or(bus_defaults.command),
        tag_prefix: config.bus.tag_prefix.unwrap_or(bus_defaults.tag_prefix),
    };

    let monitor_defaults = MonitorSettings::default();
    let monitor = MonitorSettings {
        ignore_functions: config
            .monitor
            .ignore_functions
            .unwrap_or(monitor_defaults.ignore_functions),
        ignore_job_functions: config
            .monitor
            .ignore_job_functions
            .unwrap_or(monitor_defaults.ignore_job_functions),
        orchestration_functions: config
            .monitor
            .orchestration_functions
            .unwrap_or(monitor_defaults.orchestration_functions),
        show_state_steps: config
            .monitor
            .show_state_steps
            .unwrap_or(monitor_defaults.show_state_steps),
        only_visible_steps: config
            .monitor
            .only_visible_steps
            .unwrap_or(monitor_defaults.only_visible_steps),
        show_dynamic_steps: config
            .monitor
            .show_dynamic_steps
            .unwrap_or(monitor_defaults.show_dynamic_steps),
    };

    let logging_defaults = LoggingSettings::default();
    let logging = LoggingSettings {
        file: match config.logging.file {
            Some(file) => Some(resolve_path(&base_dir, &file)),
            None => logging_defaults.file,
        },
        level: config.logging.level.unwrap_or(logging_defaults.level),
    };

    ResolvedConfig {
        config_file,
        renderer,
        bus,
        monitor,
        logging,
    }
}

/// Apply environment variable overrides
fn apply_env(mut config: ResolvedConfig) -> ResolvedConfig {
    if let Ok(root) = std::env::var("STAGETRACK_STATES_ROOT") {
        config.renderer.states_root = PathBuf::from(root);
    }
    if let Ok(prefix) = std::env::var("STAGETRACK_TAG_PREFIX") {
        config.bus.tag_prefix = prefix;
    }
    if let Ok(file) = std::env::var("STAGETRACK_LOG_FILE") {
        config.logging.file = Some(PathBuf::from(file));
    }
    config
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();

    let parsed = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(apply_env(resolve(parsed, config_file)))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
