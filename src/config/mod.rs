use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::port::{parse_user_port, user_port};

pub const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Port of the core's own server; never handed out to scripts.
    pub default_port: u16,
    /// Directory receiving packaged desktop apps
    pub apps_dir: PathBuf,
    pub install_command: String,
    pub launch_command: String,
    pub log_filter: String,
    pub restart_delay_ms: u64,
    pub kill_grace_ms: u64,
    /// Requests allowed per client within `rate_limit_window_secs`; 0 disables
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_port: DEFAULT_PORT,
            apps_dir: PathBuf::from("desktop-apps"),
            install_command: "npm install".to_string(),
            launch_command: "npm start".to_string(),
            log_filter: "info".to_string(),
            restart_delay_ms: 1000,
            kill_grace_ms: 5000,
            rate_limit_max: 100,
            rate_limit_window_secs: 15 * 60,
        }
    }
}

impl GlobalConfig {
    /// Load from `config/global.toml` (or `LOCALWRAP_CONFIG`), then apply
    /// the `PORT` environment variable and `--port=` argument overrides.
    pub fn load() -> Self {
        let path = std::env::var("LOCALWRAP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(&path);

        let env_port = std::env::var("PORT").ok();
        let args: Vec<String> = std::env::args().collect();
        cfg.default_port = resolve_default_port(env_port.as_deref(), &args, cfg.default_port);
        cfg
    }

    pub fn from_file(path: &str) -> Self {
        let s = std::fs::read_to_string(path).unwrap_or_default();
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Self {
        let mut cfg: Self = match toml::from_str(s) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Failed to parse config, using defaults: {}", e);
                Self::default()
            }
        };
        if user_port(cfg.default_port as i64).is_none() {
            tracing::warn!("Configured default_port {} is out of range, using {}", cfg.default_port, DEFAULT_PORT);
            cfg.default_port = DEFAULT_PORT;
        }
        cfg
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// `PORT` env var, then `--port=<n>`, then the configured value.
/// Invalid sources are skipped with a warning.
pub fn resolve_default_port(env_port: Option<&str>, args: &[String], configured: u16) -> u16 {
    if let Some(raw) = env_port {
        match parse_user_port(raw) {
            Some(port) => return port,
            None => tracing::warn!("Ignoring invalid PORT value '{}'", raw),
        }
    }

    if let Some(raw) = args.iter().find_map(|a| a.strip_prefix("--port=")) {
        match parse_user_port(raw) {
            Some(port) => return port,
            None => tracing::warn!("Ignoring invalid --port value '{}'", raw),
        }
    }

    configured
}
