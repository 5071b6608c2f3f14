// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bridge configuration, read from the process environment.
//!
//! The environment is the **single** configuration source — there is no
//! config file. Defaults live next to the reader so the full variable set is
//! visible in one place:
//!
//! | variable | default |
//! |----------|---------|
//! | `BRIDGE_HOST` | `127.0.0.1` |
//! | `BRIDGE_PORT` | `8765` |
//! | `BRIDGE_SECRET` | *(required)* |
//! | `AUTH_USERNAME` | `admin` |
//! | `AUTH_PASSWORD` | *(required)* |
//! | `JWT_SECRET` | *(required)* |
//! | `JWT_EXPIRY_HOURS` | `24` |
//! | `DEFAULT_TIMEOUT` | `300` seconds |
//! | `PERMISSION_TIMEOUT` | `120` seconds |
//! | `NOTIFY_TIMEOUT` | `10` seconds |
//! | `WEB_UI_URL` | *(empty — permissive CORS)* |
//! | `ENABLE_DIRECTORY_BROWSER` | `false` |
//! | `PROJECT_DIRS` | *(empty, pipe-separated)* |
//! | `LOG_LEVEL` | `info` |
//! | `LOG_FILE` | *(empty — stderr)* |
//! | `BRIDGE_DB_PATH` | `<data dir>/tether/bridge.db` |
//! | `UPLOAD_DIR` | `<data dir>/tether/uploads` |
//! | `AGENT_BIN` | `droid` |
//! | `TELEGRAM_BOT_TOKEN` | *(empty — bot disabled)* |
//! | `TELEGRAM_ALLOWED_CHAT_IDS` | *(empty, comma-separated — all chats refused)* |
//!
//! Missing `BRIDGE_SECRET`, `AUTH_PASSWORD` or `JWT_SECRET` is a startup
//! error: the process must not come up with a guessable secret.
//!
//! When a writable field is changed through the UI settings endpoint, the
//! process-wide [`mark_dirty`] flag is set so the UI can show
//! "restart required" — the running process keeps its boot-time values.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Full bridge-server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Shared secret presented by hook scripts in `X-Bridge-Secret`.
    pub bridge_secret: String,
    pub auth_username: String,
    pub auth_password: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Generic wait default, seconds (stop-hook waits).
    pub default_timeout: u64,
    /// Permission wait, seconds. Timeout means deny.
    pub permission_timeout: u64,
    /// Notify wait, seconds. No action expected.
    pub notify_timeout: u64,
    /// Allowed CORS origin for the web UI; empty means permissive.
    pub web_ui_url: Option<String>,
    pub enable_directory_browser: bool,
    /// Roots the filesystem browser and task execution may touch.
    pub project_dirs: Vec<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    /// The headless Agent executable spawned by the task executor.
    pub agent_bin: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_allowed_chat_ids: Vec<i64>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary lookup. Exists so tests can
    /// supply variables without mutating the (process-global) environment.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get_nonempty = |name: &str| get(name).filter(|v| !v.trim().is_empty());

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether");

        Ok(Self {
            host: get_nonempty("BRIDGE_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_var(&get_nonempty, "BRIDGE_PORT", 8765)?,
            bridge_secret: get_nonempty("BRIDGE_SECRET")
                .ok_or(ConfigError::Missing("BRIDGE_SECRET"))?,
            auth_username: get_nonempty("AUTH_USERNAME").unwrap_or_else(|| "admin".to_string()),
            auth_password: get_nonempty("AUTH_PASSWORD")
                .ok_or(ConfigError::Missing("AUTH_PASSWORD"))?,
            jwt_secret: get_nonempty("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            jwt_expiry_hours: parse_var(&get_nonempty, "JWT_EXPIRY_HOURS", 24)?,
            default_timeout: parse_var(&get_nonempty, "DEFAULT_TIMEOUT", 300)?,
            permission_timeout: parse_var(&get_nonempty, "PERMISSION_TIMEOUT", 120)?,
            notify_timeout: parse_var(&get_nonempty, "NOTIFY_TIMEOUT", 10)?,
            web_ui_url: get_nonempty("WEB_UI_URL"),
            enable_directory_browser: parse_bool(&get_nonempty, "ENABLE_DIRECTORY_BROWSER")?,
            project_dirs: get_nonempty("PROJECT_DIRS")
                .map(|v| v.split('|').map(PathBuf::from).collect())
                .unwrap_or_default(),
            log_level: get_nonempty("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: get_nonempty("LOG_FILE").map(PathBuf::from),
            db_path: get_nonempty("BRIDGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("bridge.db")),
            upload_dir: get_nonempty("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("uploads")),
            agent_bin: get_nonempty("AGENT_BIN").unwrap_or_else(|| "droid".to_string()),
            telegram_bot_token: get_nonempty("TELEGRAM_BOT_TOKEN"),
            telegram_allowed_chat_ids: get_nonempty("TELEGRAM_ALLOWED_CHAT_IDS")
                .map(|v| {
                    v.split(',')
                        .filter_map(|s| s.trim().parse::<i64>().ok())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<F, T>(get: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(name) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: v }),
        None => Ok(default),
    }
}

fn parse_bool<F>(get: &F, name: &'static str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: v }),
        },
        None => Ok(false),
    }
}

// ── Restart-required flag ─────────────────────────────────────────────────────

static CONFIG_DIRTY: AtomicBool = AtomicBool::new(false);

/// Record that a writable env-backed field was changed via the UI.
/// The running process keeps its boot-time configuration.
pub fn mark_dirty() {
    CONFIG_DIRTY.store(true, Ordering::Relaxed);
}

/// True when the persisted environment no longer matches the running config.
pub fn is_dirty() -> bool {
    CONFIG_DIRTY.load(Ordering::Relaxed)
}

// ── Hook-side configuration ───────────────────────────────────────────────────

/// Configuration for the `tether-hook` binary, read from the environment the
/// Agent passes down to its hooks.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub bridge_url: String,
    pub bridge_secret: String,
    pub default_timeout: u64,
    pub permission_timeout: u64,
    pub notify_timeout: u64,
    /// Set by the task executor (`AGENT_EXEC_MODE=1`): hooks must not
    /// re-enter the rendezvous path when the bridge itself spawned the Agent.
    pub exec_mode: bool,
    pub session_id: Option<String>,
    pub project_dir: Option<String>,
}

impl HookConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get_nonempty = |name: &str| get(name).filter(|v| !v.trim().is_empty());
        let num = |name: &str, default: u64| {
            get_nonempty(name)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            bridge_url: get_nonempty("BRIDGE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8765".to_string()),
            bridge_secret: get_nonempty("BRIDGE_SECRET").unwrap_or_default(),
            default_timeout: num("DEFAULT_TIMEOUT", 300),
            permission_timeout: num("PERMISSION_TIMEOUT", 120),
            notify_timeout: num("NOTIFY_TIMEOUT", 10),
            exec_mode: get("AGENT_EXEC_MODE").as_deref() == Some("1"),
            session_id: get_nonempty("AGENT_SESSION_ID"),
            project_dir: get_nonempty("AGENT_PROJECT_DIR"),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("BRIDGE_SECRET", "s3cret"),
            ("AUTH_PASSWORD", "pw"),
            ("JWT_SECRET", "jwt-key"),
        ]
    }

    #[test]
    fn defaults_are_loopback_and_info() {
        let c = Config::from_lookup(env(&minimal())).unwrap();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 8765);
        assert_eq!(c.log_level, "info");
        assert_eq!(c.permission_timeout, 120);
        assert_eq!(c.default_timeout, 300);
        assert_eq!(c.notify_timeout, 10);
        assert!(!c.enable_directory_browser);
    }

    #[test]
    fn missing_bridge_secret_is_an_error() {
        let err = Config::from_lookup(env(&[("AUTH_PASSWORD", "pw"), ("JWT_SECRET", "k")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BRIDGE_SECRET")));
    }

    #[test]
    fn missing_jwt_secret_is_an_error() {
        let err = Config::from_lookup(env(&[("BRIDGE_SECRET", "s"), ("AUTH_PASSWORD", "pw")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));
    }

    #[test]
    fn project_dirs_are_pipe_separated() {
        let mut vars = minimal();
        vars.push(("PROJECT_DIRS", "/srv/a|/srv/b"));
        let c = Config::from_lookup(env(&vars)).unwrap();
        assert_eq!(
            c.project_dirs,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
    }

    #[test]
    fn chat_ids_are_comma_separated() {
        let mut vars = minimal();
        vars.push(("TELEGRAM_ALLOWED_CHAT_IDS", "123, -456"));
        let c = Config::from_lookup(env(&vars)).unwrap();
        assert_eq!(c.telegram_allowed_chat_ids, vec![123, -456]);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut vars = minimal();
        vars.push(("BRIDGE_PORT", "not-a-port"));
        let err = Config::from_lookup(env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "BRIDGE_PORT", .. }));
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for truthy in ["1", "true", "YES", "on"] {
            let mut vars = minimal();
            vars.push(("ENABLE_DIRECTORY_BROWSER", truthy));
            assert!(Config::from_lookup(env(&vars)).unwrap().enable_directory_browser);
        }
    }

    #[test]
    fn hook_config_detects_exec_mode() {
        let hc = HookConfig::from_lookup(env(&[("AGENT_EXEC_MODE", "1")]));
        assert!(hc.exec_mode);
        let hc = HookConfig::from_lookup(env(&[]));
        assert!(!hc.exec_mode);
        assert_eq!(hc.bridge_url, "http://127.0.0.1:8765");
    }
}
