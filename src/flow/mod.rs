//! Recorded HTTP flows.
//!
//! A [`Flow`] is one request/response exchange seen by the proxy (or read
//! back from a dump). The [`io`] submodule reads and writes flow dumps.

pub mod io;

use std::io::Read;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};

/// Ordered HTTP header list. Names keep their original case; lookups ignore it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if the comma-separated header `name` contains `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Headers(iter.into_iter().collect())
    }
}

/// Client side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRequest {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    /// `http` or `https`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Origin-form target, e.g. `/sdk`.
    pub path: String,
    pub http_version: String,
    pub headers: Headers,
    #[serde(with = "body")]
    pub content: Vec<u8>,
}

impl FlowRequest {
    pub fn url(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme, self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }
}

/// Server side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: Headers,
    /// Body as received on the wire (still content-encoded).
    #[serde(with = "body")]
    pub content: Vec<u8>,
}

impl FlowResponse {
    /// Body with any `gzip`/`deflate` content-encoding removed.
    ///
    /// Falls back to the raw bytes if the encoding is unknown or broken.
    pub fn decoded_content(&self) -> std::borrow::Cow<'_, [u8]> {
        let encoding = self
            .headers
            .get("content-encoding")
            .map(|e| e.trim().to_ascii_lowercase());
        let decoded = match encoding.as_deref() {
            Some("gzip") | Some("x-gzip") => decode(GzDecoder::new(self.content.as_slice())),
            Some("deflate") => decode(ZlibDecoder::new(self.content.as_slice())),
            _ => None,
        };
        match decoded {
            Some(bytes) => std::borrow::Cow::Owned(bytes),
            None => std::borrow::Cow::Borrowed(&self.content),
        }
    }
}

fn decode(mut reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).ok()?;
    Some(out)
}

/// A single request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: u64,
    #[serde(default)]
    pub client_addr: Option<SocketAddr>,
    pub request: FlowRequest,
    #[serde(default)]
    pub response: Option<FlowResponse>,
}

impl Flow {
    pub fn new(id: u64, client_addr: Option<SocketAddr>, request: FlowRequest) -> Self {
        Self {
            id,
            client_addr,
            request,
            response: None,
        }
    }
}

/// Base64 (de)serialization for message bodies.
mod body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
