use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

pub const CONFIG_PATHS: [&str; 2] = ["ohmygpu.toml", "OhMyGpu.toml"];

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_nvidia_smi_path")]
    pub nvidia_smi_path: String,
    #[serde(default = "default_wmic_path")]
    pub wmic_path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub skip_adapters: Vec<String>,
}
fn default_nvidia_smi_path() -> String {
    "nvidia-smi".into()
}
fn default_wmic_path() -> String {
    "wmic".into()
}
fn default_timeout_ms() -> u64 {
    5_000
}
impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            nvidia_smi_path: default_nvidia_smi_path(),
            wmic_path: default_wmic_path(),
            timeout_ms: default_timeout_ms(),
            skip_adapters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_clean_log")]
    pub clean_log_on_start: bool,
}
fn default_log_level() -> String {
    "warn".into()
}
fn default_log_dir() -> String {
    ".logs".into()
}
fn default_clean_log() -> bool {
    true
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
            dir: default_log_dir(),
            clean_log_on_start: default_clean_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_pause_on_exit")]
    pub pause_on_exit: bool,
}
fn default_pause_on_exit() -> bool {
    true
}
impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { pause_on_exit: default_pause_on_exit() }
    }
}

#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub nvidia_smi_path: String,
    pub wmic_path: String,
    pub timeout: Duration,
    pub skip_adapters: Vec<Regex>,
    pub invalid_patterns: Vec<String>,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_dir: PathBuf,
    pub clean_log_on_start: bool,
    pub pause_on_exit: bool,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        resolve_config(RawConfig::default(), |_| None)
    }
}

pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# OH MY GPU configuration

[sources]
# Path or name of the nvidia-smi executable. Default: "nvidia-smi"
nvidia_smi_path = "nvidia-smi"
# Path or name of the wmic executable used as fallback. Default: "wmic"
wmic_path = "wmic"
# Kill an external tool that takes longer than this (milliseconds). Default: 5000
timeout_ms = 5000
# Regex patterns; wmic adapters whose name matches are skipped.
# Example: ignore the inbox display driver and RDP adapters
# skip_adapters = ["^Microsoft Basic Display Adapter$", "Remote Display"]
skip_adapters = []

[logging]
# Default log filter when RUST_LOG is unset. Default: "warn"
level = "warn"
# Also write logs to <dir>/latest.log. Default: false
file = false
dir = ".logs"
# Truncate latest.log on startup. Default: true
clean_log_on_start = true

[console]
# Wait for Enter before exiting the console report. Default: true
pause_on_exit = true"#;

pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Loads `.env`, the optional config file and the `OHMYGPU_*` overrides.
pub fn load_config() -> Result<EffectiveConfig> {
    let _ = dotenvy::dotenv();

    let raw = match find_config_file() {
        Some(path) => read_config_file(&path)?,
        None => RawConfig::default(),
    };
    Ok(resolve_config(raw, |key| std::env::var(key).ok()))
}

pub fn read_config_file(path: &Path) -> Result<RawConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str::<RawConfig>(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn resolve_config(raw: RawConfig, env: impl Fn(&str) -> Option<String>) -> EffectiveConfig {
    // A zero timeout would fail every source before it starts.
    let timeout_ms = env("OHMYGPU_TIMEOUT_MS")
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .or_else(|| Some(raw.sources.timeout_ms).filter(|ms| *ms > 0))
        .unwrap_or_else(default_timeout_ms);

    // Logging is not up yet; bad patterns are reported by the caller.
    let mut skip_adapters = Vec::new();
    let mut invalid_patterns = Vec::new();
    for p in &raw.sources.skip_adapters {
        match Regex::new(p) {
            Ok(re) => skip_adapters.push(re),
            Err(_) => invalid_patterns.push(p.clone()),
        }
    }

    EffectiveConfig {
        nvidia_smi_path: env("OHMYGPU_NVIDIA_SMI").unwrap_or(raw.sources.nvidia_smi_path),
        wmic_path: env("OHMYGPU_WMIC").unwrap_or(raw.sources.wmic_path),
        timeout: Duration::from_millis(timeout_ms),
        skip_adapters,
        invalid_patterns,
        log_level: raw.logging.level,
        log_to_file: raw.logging.file,
        log_dir: PathBuf::from(env("OHMYGPU_LOG_DIR").unwrap_or(raw.logging.dir)),
        clean_log_on_start: raw.logging.clean_log_on_start,
        pause_on_exit: raw.console.pause_on_exit,
    }
}
