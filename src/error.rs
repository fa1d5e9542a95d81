use thiserror::Error;

/// Unified error type for the permdump library.
#[derive(Debug, Error)]
pub enum PermDumpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Environment variable not set: {0}")]
    ConfigEnvVar(String),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value {value:?} for option {name}: {reason}")]
    InvalidOption {
        name: String,
        value: String,
        reason: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Flow file corrupted at line {line}: {source}")]
    FlowFormat {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Proxy error: {0}")]
    Proxy(String),
}

pub type Result<T> = std::result::Result<T, PermDumpError>;

impl From<tokio_rustls::rustls::Error> for PermDumpError {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        PermDumpError::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for PermDumpError {
    fn from(e: rcgen::Error) -> Self {
        PermDumpError::Certificate(e.to_string())
    }
}
