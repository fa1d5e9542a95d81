//! # permdump
//!
//! **Find out which vSphere privileges your automation is missing.**
//!
//! permdump is a local HTTP/HTTPS proxy placed between a vSphere API client
//! (pyvmomi, govc, Terraform, ...) and vCenter. Every SOAP response carrying a
//! `NoPermissionFault` is recorded with the client's user agent, the object it
//! touched and the privilege it lacked.
//!
//! ## Architecture
//!
//! - **[`proxy`]**: TCP proxy server with HTTP forwarding and TLS interception of CONNECT tunnels
//! - **[`addon`]**: flow hook pipeline and the permission-failure recorder
//! - **[`soap`]**: `NoPermissionFault` detection and extraction
//! - **[`flow`]**: captured request/response pairs and the JSON Lines dump format
//! - **[`replay`]**: offline replay of flow dumps
//! - **[`logging`]**: console logging and the CSV flat file
//! - **[`config`]**: TOML configuration and `--set` overrides
//! - **[`cli`]**: command-line interface (clap)
//! - **[`error`]**: unified error types using `thiserror`
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a default permdump.toml
//! permdump init
//!
//! # Start the proxy, recording failures to a CSV file
//! permdump capture --set vs_dump_csv=failures.csv
//!
//! # Trust the interception CA, then route the client through the proxy
//! permdump ca --pem > permdump-ca.pem
//! export HTTPS_PROXY=http://127.0.0.1:8080
//! ```

pub mod addon;
pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod proxy;
pub mod replay;
pub mod soap;
