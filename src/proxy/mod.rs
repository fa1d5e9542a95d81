pub mod connect;
pub mod http;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::addon::AddonManager;
use crate::error::Result;
use tls::{CertificateManager, UpstreamConnector};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared by every connection task.
pub struct ProxyContext {
    pub addons: Arc<AddonManager>,
    pub certificates: Option<Arc<CertificateManager>>,
    pub upstream: UpstreamConnector,
    pub connect_timeout: Duration,
    next_id: AtomicU64,
}

impl ProxyContext {
    /// Allocate the next flow id. Ids start at 1.
    pub fn next_flow_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct ProxyServer {
    listen_addr: String,
    addons: Arc<AddonManager>,
    certificates: Option<Arc<CertificateManager>>,
    upstream: Option<UpstreamConnector>,
    connect_timeout: Duration,
}

impl ProxyServer {
    pub fn new(listen_addr: String) -> Self {
        Self {
            listen_addr,
            addons: Arc::new(AddonManager::new()),
            certificates: None,
            upstream: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_addons(mut self, addons: Arc<AddonManager>) -> Self {
        self.addons = addons;
        self
    }

    /// Enable TLS interception of CONNECT tunnels. Without certificates,
    /// tunnels are relayed blind.
    pub fn with_certificates(mut self, certificates: Arc<CertificateManager>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    /// Override the upstream TLS connector (defaults to verifying against webpki roots).
    pub fn with_upstream(mut self, upstream: UpstreamConnector) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Start the proxy server and return the actual bound address.
    pub async fn start(self) -> Result<SocketAddr> {
        let upstream = match self.upstream {
            Some(upstream) => upstream,
            None => UpstreamConnector::new(false)?,
        };
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Proxy listening on {} (TLS interception {})",
            local_addr,
            if self.certificates.is_some() { "on" } else { "off" }
        );

        let ctx = Arc::new(ProxyContext {
            addons: self.addons,
            certificates: self.certificates,
            upstream,
            connect_timeout: self.connect_timeout,
            next_id: AtomicU64::new(0),
        });

        tokio::spawn(async move {
            connect::accept_loop(listener, ctx).await;
        });

        Ok(local_addr)
    }
}
