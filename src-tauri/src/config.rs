use crate::error::{Result, ShellError};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BACKEND_PORT: u16 = 27421;
pub const HEALTH_PATH: &str = "/api/health";
pub const DEFAULT_SWEEP_PATTERN: &str = "chromium|playwright";
pub const ASSET_DIR_PREFIX: &str = "chromium";

const PROFILE_ENV: &str = "GREETDESK_PROFILE";
const PORT_ENV: &str = "GREETDESK_BACKEND_PORT";
const MODE_ENV: &str = "GREETDESK_MODE";
const ACCOUNT_ENV: &str = "GREETDESK_ACCOUNT";
const BACKEND_DIR_ENV: &str = "GREETDESK_BACKEND_DIR";
const ASSET_CACHE_ENV: &str = "GREETDESK_ASSET_CACHE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Development,
    Production,
}

impl LaunchMode {
    fn from_raw(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "dev" | "development" => Some(Self::Development),
            "prod" | "production" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Optional JSON profile; every field overrides the compiled-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ShellProfile {
    mode: Option<String>,
    backend_port: Option<u16>,
    account: Option<String>,
    backend_dir: Option<String>,
    asset_cache_dir: Option<String>,
    settle_delay_ms: Option<u64>,
    health_attempts: Option<u32>,
    health_interval_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    sweep_pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub mode: LaunchMode,
    pub backend_port: u16,
    pub account_selector: Option<String>,
    /// Development backend source tree; production resolves from the resource bundle.
    pub backend_dir: Option<PathBuf>,
    pub asset_cache_dir: PathBuf,
    pub asset_prefix: String,
    pub settle_delay: Duration,
    pub health_attempts: u32,
    pub health_interval: Duration,
    pub grace_period: Duration,
    /// `pkill -f` pattern for stray browser processes; `None` disables the sweep.
    pub sweep_pattern: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            mode: if cfg!(debug_assertions) {
                LaunchMode::Development
            } else {
                LaunchMode::Production
            },
            backend_port: DEFAULT_BACKEND_PORT,
            account_selector: None,
            backend_dir: None,
            asset_cache_dir: default_asset_cache_dir(),
            asset_prefix: ASSET_DIR_PREFIX.to_string(),
            settle_delay: Duration::from_secs(3),
            health_attempts: 10,
            health_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(2),
            sweep_pattern: Some(DEFAULT_SWEEP_PATTERN.to_string()),
        }
    }
}

impl ShellConfig {
    /// Defaults, then the profile named by `GREETDESK_PROFILE`, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = env::var(PROFILE_ENV).ok().and_then(|raw| normalize_path(&raw)) {
            config.apply_profile(&load_profile(&path)?);
        }
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.backend_port)
    }

    fn apply_profile(&mut self, profile: &ShellProfile) {
        if let Some(mode) = profile.mode.as_deref().and_then(LaunchMode::from_raw) {
            self.mode = mode;
        }
        if let Some(port) = profile.backend_port {
            self.backend_port = port;
        }
        if let Some(account) = profile.account.as_deref().and_then(non_empty) {
            self.account_selector = Some(account);
        }
        if let Some(dir) = profile.backend_dir.as_deref().and_then(normalize_path) {
            self.backend_dir = Some(dir);
        }
        if let Some(dir) = profile.asset_cache_dir.as_deref().and_then(normalize_path) {
            self.asset_cache_dir = dir;
        }
        if let Some(ms) = profile.settle_delay_ms {
            self.settle_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = profile.health_attempts {
            self.health_attempts = attempts.max(1);
        }
        if let Some(ms) = profile.health_interval_ms {
            self.health_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = profile.grace_period_ms {
            self.grace_period = Duration::from_millis(ms);
        }
        if let Some(pattern) = profile.sweep_pattern.as_deref() {
            self.sweep_pattern = non_empty(pattern);
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(PORT_ENV) {
            self.backend_port = raw
                .trim()
                .parse()
                .map_err(|_| ShellError::Config(format!("{PORT_ENV} is not a port: {raw}")))?;
        }
        if let Some(raw) = lookup(MODE_ENV) {
            self.mode = LaunchMode::from_raw(&raw)
                .ok_or_else(|| ShellError::Config(format!("{MODE_ENV} is not a mode: {raw}")))?;
        }
        if let Some(account) = lookup(ACCOUNT_ENV).as_deref().and_then(non_empty) {
            self.account_selector = Some(account);
        }
        if let Some(dir) = lookup(BACKEND_DIR_ENV).as_deref().and_then(normalize_path) {
            self.backend_dir = Some(dir);
        }
        if let Some(dir) = lookup(ASSET_CACHE_ENV).as_deref().and_then(normalize_path) {
            self.asset_cache_dir = dir;
        }
        Ok(())
    }
}

fn load_profile(path: &Path) -> Result<ShellProfile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ShellError::Config(format!("cannot read profile {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| ShellError::Config(format!("invalid profile {}: {e}", path.display())))
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn normalize_path(raw: &str) -> Option<PathBuf> {
    non_empty(raw).map(PathBuf::from)
}

/// Where the browser engine installer puts its builds on this platform.
fn default_asset_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ms-playwright")
}
