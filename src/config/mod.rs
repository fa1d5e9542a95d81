//! TOML configuration and `--set` option overrides.
//!
//! The top-level [`AppConfig`] is deserialized from `permdump.toml`. Every
//! section and key is optional. Individual options can then be overridden
//! from the command line with `--set name=value`, using the same option
//! names the capture add-on has always used.
//!
//! # Example `permdump.toml`
//!
//! ```toml
//! [proxy]
//! listen_host = "0.0.0.0"
//! listen_port = 8080
//! ssl_insecure = true
//!
//! [capture]
//! dump_flows = "/data/failures.jsonl"
//! dump_csv = "/data/failures.csv"
//! duplicates = false
//!
//! [log]
//! verbosity = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PermDumpError, Result};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "permdump.toml";

/// Option names accepted by `--set`.
pub const OPTION_NAMES: &[&str] = &[
    "vs_dump_flows",
    "vs_dump_csv",
    "vs_duplicates",
    "listen_host",
    "listen_port",
    "server",
    "ssl_insecure",
    "intercept_tls",
    "confdir",
    "console_eventlog_verbosity",
    "termlog_verbosity",
];

/// Proxy server configuration (`[proxy]` section).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface to bind.
    pub listen_host: String,
    /// Port to bind (0 picks a free port).
    pub listen_port: u16,
    /// Start the live proxy. Disabled by `--no-server` for pure replay.
    pub server: bool,
    /// Skip certificate verification for upstream TLS servers.
    pub ssl_insecure: bool,
    /// Decrypt CONNECT tunnels with a locally generated CA.
    pub intercept_tls: bool,
    /// Directory holding the CA certificate and key.
    pub confdir: PathBuf,
    /// Upstream connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            server: true,
            ssl_insecure: false,
            intercept_tls: true,
            confdir: default_confdir(),
            connect_timeout_secs: 30,
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

/// Permission-failure capture settings (`[capture]` section).
///
/// Empty paths disable the corresponding output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Flow dump output (`vs_dump_flows`).
    pub dump_flows: String,
    /// CSV flat file output (`vs_dump_csv`).
    pub dump_csv: String,
    /// Record repeated failures instead of only the first (`vs_duplicates`).
    pub duplicates: bool,
}

impl CaptureConfig {
    pub fn dump_flows_path(&self) -> Option<&Path> {
        non_empty_path(&self.dump_flows)
    }

    pub fn dump_csv_path(&self) -> Option<&Path> {
        non_empty_path(&self.dump_csv)
    }
}

fn non_empty_path(value: &str) -> Option<&Path> {
    if value.is_empty() {
        None
    } else {
        Some(Path::new(value))
    }
}

/// Console log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Verbosity::Error),
            "warn" | "warning" => Ok(Verbosity::Warn),
            "info" => Ok(Verbosity::Info),
            "debug" => Ok(Verbosity::Debug),
            "trace" => Ok(Verbosity::Trace),
            _ => Err("expected one of error, warn, info, debug, trace".to_string()),
        }
    }
}

/// Logging configuration (`[log]` section).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub verbosity: Verbosity,
}

/// Top-level application configuration deserialized from `permdump.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub capture: CaptureConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load and parse the configuration from a TOML file at the given path.
    ///
    /// Before parsing, `${VAR}` and `$VAR` placeholders in the TOML text are
    /// replaced with the corresponding environment variable values. An error is
    /// returned if a referenced variable is not set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load an explicit config file, or `permdump.toml` if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::load_from_path(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply a single `--set` option.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "vs_dump_flows" => self.capture.dump_flows = value.to_string(),
            "vs_dump_csv" => self.capture.dump_csv = value.to_string(),
            "vs_duplicates" => self.capture.duplicates = parse_bool(name, value)?,
            "listen_host" => self.proxy.listen_host = value.to_string(),
            "listen_port" => {
                self.proxy.listen_port =
                    value.trim().parse().map_err(|_| PermDumpError::InvalidOption {
                        name: name.to_string(),
                        value: value.to_string(),
                        reason: "expected a port number".to_string(),
                    })?
            }
            "server" => self.proxy.server = parse_bool(name, value)?,
            "ssl_insecure" => self.proxy.ssl_insecure = parse_bool(name, value)?,
            "intercept_tls" => self.proxy.intercept_tls = parse_bool(name, value)?,
            "confdir" => self.proxy.confdir = expand_home(value),
            "console_eventlog_verbosity" | "termlog_verbosity" => {
                self.log.verbosity =
                    value
                        .parse()
                        .map_err(|reason| PermDumpError::InvalidOption {
                            name: name.to_string(),
                            value: value.to_string(),
                            reason,
                        })?
            }
            _ => return Err(PermDumpError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Apply a list of `name=value` assignments in order.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, assignments: &[S]) -> Result<()> {
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (name, value) =
                assignment
                    .split_once('=')
                    .ok_or_else(|| PermDumpError::InvalidOption {
                        name: assignment.to_string(),
                        value: String::new(),
                        reason: "expected name=value".to_string(),
                    })?;
            self.set(name.trim(), value)?;
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(PermDumpError::InvalidOption {
            name: name.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn default_confdir() -> PathBuf {
    home_dir().join(".permdump")
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None if value == "~" => home_dir(),
        None => PathBuf::from(value),
    }
}

/// Replace `${VAR_NAME}` and `$VAR_NAME` placeholders with environment variable values.
///
/// Returns an error containing the variable name if the variable is not set.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re_braces = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    // Bare form is uppercase only to avoid false positives
    let re_bare = Regex::new(r"\$([A-Z_][A-Z0-9_]*)").expect("valid regex");

    let mut result = input.to_string();

    for cap in re_braces.captures_iter(input) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| PermDumpError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    let intermediate = result.clone();
    for cap in re_bare.captures_iter(&intermediate) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| PermDumpError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
