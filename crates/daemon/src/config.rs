//! Configuration management for the TermRelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrelay/config.toml`.
//! Environment variables are applied on top of the file.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 0.0.0.0:8080, got {0}")]
    InvalidListenAddr(String),

    #[error("path must start with '/', got {0}")]
    InvalidPath(String),

    #[error("auth_timeout_secs must be between 1 and 60, got {0}")]
    InvalidAuthTimeout(u64),

    #[error("poll_interval_ms must be between 10 and 1000, got {0}")]
    InvalidPollInterval(u64),

    #[error("rows and cols must be greater than 0, got {rows}x{cols}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermRelay daemon.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Channel listener configuration.
    pub network: NetworkConfig,

    /// Shell session configuration.
    pub session: SessionConfig,

    /// Credential and ownership settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to this file.
    pub log_file: Option<PathBuf>,

    /// Control socket path. Defaults to a per-user runtime location.
    pub socket_path: Option<PathBuf>,
}

/// Channel listener configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: String,

    /// Request path that accepts terminal channels.
    pub path: String,

    /// Seconds a new channel has to present its credential.
    pub auth_timeout_secs: u64,
}

/// Shell session configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for each session.
    pub shell: String,

    /// Whether interactive shells may be started. Off unless explicitly enabled.
    pub allow_unrestricted_shell: bool,

    /// Directory new shells start in. Defaults to the daemon's directory.
    pub working_dir: Option<PathBuf>,

    /// Milliseconds between SIGTERM and SIGKILL when closing a session.
    pub kill_grace_ms: u64,

    /// Upper bound on a single output poll, in milliseconds.
    pub poll_interval_ms: u64,

    /// Close sessions idle this many seconds (0 = never).
    pub idle_timeout_secs: u64,

    /// Treat frames that are not valid messages as typed input.
    pub raw_input_fallback: bool,

    /// Initial terminal rows.
    pub rows: u16,

    /// Initial terminal columns.
    pub cols: u16,
}

/// Credential and ownership settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Bot token the credentials are signed with.
    pub bot_token: String,

    /// Principals allowed to open a terminal.
    pub owner_ids: Vec<i64>,

    /// Oldest credential accepted, in seconds.
    pub max_auth_age_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
            socket_path: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            path: "/ws/terminal".to_string(),
            auth_timeout_secs: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            allow_unrestricted_shell: false,
            working_dir: None,
            kill_grace_ms: 250,
            poll_interval_ms: 100,
            idle_timeout_secs: 0,
            raw_input_fallback: true,
            rows: 24,
            cols: 80,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            owner_ids: Vec::new(),
            max_auth_age_secs: protocol::DEFAULT_MAX_AGE_SECS,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
}

/// Returns the default shell: bash when installed, else `$SHELL`, else `/bin/sh`.
fn default_shell() -> String {
    if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Parses a list of principal ids separated by commas or whitespace.
///
/// Entries that are not integers are skipped.
pub fn parse_owner_ids(raw: &str) -> Vec<i64> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("Ignoring invalid owner id: {}", s);
                None
            }
        })
        .collect()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Splits `host:port`, keeping IPv6 brackets on the host.
fn split_host_port(addr: &str) -> (&str, &str) {
    match addr.rfind(':') {
        Some(idx) => (&addr[..idx], &addr[idx + 1..]),
        None => (addr, ""),
    }
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored. Supported variables:
    /// - BOT_TOKEN: Token credentials are signed with
    /// - OWNER_ID: Allowed principals, comma or newline separated
    /// - SHELL_EXECUTABLE: Shell program
    /// - ALLOW_ALL_COMMANDS: Enable interactive shells (1, true, yes, on)
    /// - WEBAPP_HOST / WEBAPP_PORT: Listener host and port
    /// - TERMRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns a description of each override applied, for logging once
    /// tracing is initialised.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        let mut applied = Vec::new();

        if let Some(token) = env_value("BOT_TOKEN") {
            self.security.bot_token = token;
            applied.push("bot_token".to_string());
        }

        if let Some(owners) = env_value("OWNER_ID") {
            self.security.owner_ids = parse_owner_ids(&owners);
            applied.push(format!("owner_ids: {} owner(s)", self.security.owner_ids.len()));
        }

        if let Some(shell) = env_value("SHELL_EXECUTABLE") {
            applied.push(format!("shell: {}", shell));
            self.session.shell = shell;
        }

        if let Some(flag) = env_value("ALLOW_ALL_COMMANDS") {
            self.session.allow_unrestricted_shell = parse_flag(&flag);
            applied.push(format!(
                "allow_unrestricted_shell: {}",
                self.session.allow_unrestricted_shell
            ));
        }

        let host = env_value("WEBAPP_HOST");
        let port = env_value("WEBAPP_PORT");
        if host.is_some() || port.is_some() {
            let (current_host, current_port) = split_host_port(&self.network.listen_addr);
            let addr = join_host_port(
                host.as_deref().unwrap_or(current_host),
                port.as_deref().unwrap_or(current_port),
            );
            applied.push(format!("listen_addr: {}", addr));
            self.network.listen_addr = addr;
        }

        if let Some(level) = env_value("TERMRELAY_LOG_LEVEL") {
            applied.push(format!("log_level: {}", level));
            self.daemon.log_level = level;
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.network.listen_addr.clone(),
            ));
        }

        if !self.network.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.network.path.clone()));
        }

        if !(1..=60).contains(&self.network.auth_timeout_secs) {
            return Err(ConfigError::InvalidAuthTimeout(
                self.network.auth_timeout_secs,
            ));
        }

        if !(10..=1000).contains(&self.session.poll_interval_ms) {
            return Err(ConfigError::InvalidPollInterval(
                self.session.poll_interval_ms,
            ));
        }

        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: self.session.rows,
                cols: self.session.cols,
            });
        }

        // which handles both absolute paths and PATH lookups
        if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_KEYS: &[&str] = &[
        "BOT_TOKEN",
        "OWNER_ID",
        "SHELL_EXECUTABLE",
        "ALLOW_ALL_COMMANDS",
        "WEBAPP_HOST",
        "WEBAPP_PORT",
        "TERMRELAY_LOG_LEVEL",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.network.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.network.path, "/ws/terminal");
        assert_eq!(config.network.auth_timeout_secs, 5);
        assert!(!config.session.allow_unrestricted_shell);
        assert_eq!(config.session.kill_grace_ms, 250);
        assert_eq!(config.session.poll_interval_ms, 100);
        assert_eq!(config.session.idle_timeout_secs, 0);
        assert!(config.session.raw_input_fallback);
        assert_eq!((config.session.rows, config.session.cols), (24, 80));
        assert!(config.security.bot_token.is_empty());
        assert!(config.security.owner_ids.is_empty());
        assert_eq!(config.security.max_auth_age_secs, 86_400);
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("termrelay"));
        assert!(config.log_file.is_none());
        assert!(config.socket_path.is_none());
    }

    #[test]
    fn test_default_shell() {
        let shell = default_shell();
        assert!(!shell.is_empty());
        if Path::new("/bin/bash").exists() {
            assert_eq!(shell, "/bin/bash");
        }
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[network]
listen_addr = "127.0.0.1:9000"

[session]
allow_unrestricted_shell = true
idle_timeout_secs = 600
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.network.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.network.path, "/ws/terminal");
        assert!(config.session.allow_unrestricted_shell);
        assert_eq!(config.session.idle_timeout_secs, 600);
        assert_eq!(config.session.kill_grace_ms, 250);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/var/lib/termrelay"
log_level = "debug"
log_file = "/var/log/termrelay.log"
socket_path = "/run/termrelay.sock"

[network]
listen_addr = "[::1]:8443"
path = "/terminal"
auth_timeout_secs = 10

[session]
shell = "/bin/sh"
allow_unrestricted_shell = true
working_dir = "/srv"
kill_grace_ms = 1000
poll_interval_ms = 50
idle_timeout_secs = 3600
raw_input_fallback = false
rows = 50
cols = 200

[security]
bot_token = "123:abc"
owner_ids = [1, 2, 3]
max_auth_age_secs = 3600
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/var/lib/termrelay"));
        assert_eq!(config.daemon.log_file, Some(PathBuf::from("/var/log/termrelay.log")));
        assert_eq!(config.daemon.socket_path, Some(PathBuf::from("/run/termrelay.sock")));
        assert_eq!(config.network.path, "/terminal");
        assert_eq!(config.network.auth_timeout_secs, 10);
        assert_eq!(config.session.working_dir, Some(PathBuf::from("/srv")));
        assert!(!config.session.raw_input_fallback);
        assert_eq!((config.session.rows, config.session.cols), (50, 200));
        assert_eq!(config.security.bot_token, "123:abc");
        assert_eq!(config.security.owner_ids, vec![1, 2, 3]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[network\nlisten_addr = 1").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let result = Config::from_toml("[session]\nrows = \"many\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/termrelay/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("termrelay/config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[session]
shell = "/bin/sh"
future_option = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.session.shell, "/bin/sh");
    }

    #[test]
    fn test_parse_owner_ids() {
        assert_eq!(parse_owner_ids("1,2, 3"), vec![1, 2, 3]);
        assert_eq!(parse_owner_ids("10\n20\n"), vec![10, 20]);
        assert_eq!(parse_owner_ids("5,abc,,6"), vec![5, 6]);
        assert!(parse_owner_ids("").is_empty());
    }

    #[test]
    fn test_parse_flag() {
        for value in ["1", "true", "YES", "On", " true "] {
            assert!(parse_flag(value), "{}", value);
        }
        for value in ["0", "false", "no", "off", "maybe"] {
            assert!(!parse_flag(value), "{}", value);
        }
    }

    #[test]
    fn test_split_and_join_host_port() {
        assert_eq!(split_host_port("0.0.0.0:8080"), ("0.0.0.0", "8080"));
        assert_eq!(split_host_port("[::1]:80"), ("[::1]", "80"));
        assert_eq!(join_host_port("::1", "80"), "[::1]:80");
        assert_eq!(join_host_port("[::1]", "80"), "[::1]:80");
        assert_eq!(join_host_port("127.0.0.1", "9"), "127.0.0.1:9");
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        clear_env();
        std::env::set_var("BOT_TOKEN", "999:env-token");
        std::env::set_var("OWNER_ID", "11,22");
        std::env::set_var("SHELL_EXECUTABLE", "/bin/sh");
        std::env::set_var("ALLOW_ALL_COMMANDS", "true");
        std::env::set_var("WEBAPP_PORT", "9090");
        std::env::set_var("TERMRELAY_LOG_LEVEL", "debug");

        let mut config = Config::default();
        let applied = config.apply_env_overrides();
        clear_env();

        assert_eq!(applied.len(), 6);
        assert!(applied.contains(&"log_level: debug".to_string()));
        assert!(applied.iter().all(|entry| !entry.contains("env-token")));
        assert_eq!(config.security.bot_token, "999:env-token");
        assert_eq!(config.security.owner_ids, vec![11, 22]);
        assert_eq!(config.session.shell, "/bin/sh");
        assert!(config.session.allow_unrestricted_shell);
        assert_eq!(config.network.listen_addr, "0.0.0.0:9090");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_env_override_host_only() {
        clear_env();
        std::env::set_var("WEBAPP_HOST", "127.0.0.1");

        let mut config = Config::default();
        config.apply_env_overrides();
        clear_env();

        assert_eq!(config.network.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var("BOT_TOKEN", "");
        std::env::set_var("ALLOW_ALL_COMMANDS", "");

        let mut config = Config::default();
        config.security.bot_token = "from-file".to_string();
        config.session.allow_unrestricted_shell = true;
        let applied = config.apply_env_overrides();
        clear_env();

        assert!(applied.is_empty());
        assert_eq!(config.security.bot_token, "from-file");
        assert!(config.session.allow_unrestricted_shell);
    }

    #[test]
    #[serial]
    fn test_env_override_can_disable_shell() {
        clear_env();
        std::env::set_var("ALLOW_ALL_COMMANDS", "0");

        let mut config = Config::default();
        config.session.allow_unrestricted_shell = true;
        config.apply_env_overrides();
        clear_env();

        assert!(!config.session.allow_unrestricted_shell);
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();
        let mut config = valid_config();
        let before = config.clone();
        assert!(config.apply_env_overrides().is_empty());
        assert_eq!(config, before);
    }

    #[test]
    fn test_validate_default_shape() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = valid_config();
        config.network.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_path() {
        let mut config = valid_config();
        config.network.path = "ws/terminal".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPath("ws/terminal".to_string()))
        );
    }

    #[test]
    fn test_validate_auth_timeout_bounds() {
        let mut config = valid_config();
        config.network.auth_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidAuthTimeout(0)));
        config.network.auth_timeout_secs = 61;
        assert_eq!(config.validate(), Err(ConfigError::InvalidAuthTimeout(61)));
        config.network.auth_timeout_secs = 1;
        assert!(config.validate().is_ok());
        config.network.auth_timeout_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_poll_interval_bounds() {
        let mut config = valid_config();
        config.session.poll_interval_ms = 5;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(5)));
        config.session.poll_interval_ms = 1001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(1001)));
        config.session.poll_interval_ms = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_terminal_size() {
        let mut config = valid_config();
        config.session.cols = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTerminalSize { rows: 24, cols: 0 })
        );
    }

    #[test]
    fn test_validate_shell_path() {
        let mut config = valid_config();
        config.session.shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.shell = "/nonexistent/shell/path".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell/path".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        for level in VALID_LOG_LEVELS {
            config.daemon.log_level = level.to_uppercase();
            assert!(config.validate().is_ok());
        }
        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
