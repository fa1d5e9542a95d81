use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::AppConfig;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "permdump")]
#[command(about = "Capture vSphere SOAP permission failures through an intercepting proxy")]
#[command(version)]
pub struct Cli {
    /// Path to config file (defaults to ./permdump.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy and record permission failures
    Capture(CaptureArgs),
    /// Show the interception CA certificate
    Ca {
        /// Print the certificate PEM instead of its path
        #[arg(long)]
        pem: bool,
    },
    /// List the permission failures recorded in a flow dump
    Inspect {
        /// Flow dump to read
        file: PathBuf,
        /// Output format
        #[arg(long, value_enum, default_value_t = InspectFormat::Table)]
        format: InspectFormat,
    },
    /// Write a default permdump.toml
    Init,
}

#[derive(clap::Args, Debug, Default)]
pub struct CaptureArgs {
    /// Replay flows from a dump before (or instead of) serving
    #[arg(short, long)]
    pub rfile: Option<PathBuf>,

    /// Do not start the proxy server
    #[arg(long)]
    pub no_server: bool,

    /// Address to bind
    #[arg(long)]
    pub listen_host: Option<String>,

    /// Port to bind
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,

    /// Do not verify upstream server certificates
    #[arg(short = 'k', long)]
    pub ssl_insecure: bool,

    /// Relay CONNECT tunnels without decrypting them
    #[arg(long)]
    pub no_tls_intercept: bool,

    /// Set an option (name=value), may be repeated
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub set: Vec<String>,
}

impl CaptureArgs {
    /// Apply `--set` assignments, then the dedicated flags, which win.
    pub fn apply_to(&self, config: &mut AppConfig) -> Result<()> {
        config.apply_overrides(self.set.as_slice())?;

        if self.no_server {
            config.proxy.server = false;
        }
        if let Some(host) = &self.listen_host {
            config.proxy.listen_host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.proxy.listen_port = port;
        }
        if self.ssl_insecure {
            config.proxy.ssl_insecure = true;
        }
        if self.no_tls_intercept {
            config.proxy.intercept_tls = false;
        }
        Ok(())
    }

    /// Load the config file (or defaults) and apply these arguments.
    pub fn load_config(&self, config_path: Option<&Path>) -> Result<AppConfig> {
        let mut config = AppConfig::load(config_path)?;
        self.apply_to(&mut config)?;
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InspectFormat {
    Table,
    Csv,
}
