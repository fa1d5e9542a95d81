use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::http::{self, RequestHead};
use super::ProxyContext;
use crate::error::{PermDumpError, Result};
use crate::flow::{Flow, FlowRequest, FlowResponse};

/// Where requests on a client connection are headed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    /// Plain proxy connection: each request names its target in absolute form.
    Absolute,
    /// Intercepted CONNECT tunnel: every request goes to the tunnel target over TLS.
    Tunnel { host: String, port: u16 },
}

/// Main accept loop: accept incoming connections and handle them.
pub async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New connection from {}", peer_addr);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer_addr, &ctx).await {
                        warn!("Error handling connection from {}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(client: TcpStream, peer: SocketAddr, ctx: &ProxyContext) -> Result<()> {
    let mut reader = BufReader::new(client);
    let head = match http::read_request_head(&mut reader).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            reply_error(&mut reader, 400, "Bad Request").await;
            return Err(e);
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, peer, head, ctx).await
    } else {
        serve_requests(reader, peer, Origin::Absolute, Some(head), ctx).await
    }
}

/// Handle CONNECT: intercept when certificates are available, otherwise tunnel.
async fn handle_connect(
    mut client: BufReader<TcpStream>,
    peer: SocketAddr,
    head: RequestHead,
    ctx: &ProxyContext,
) -> Result<()> {
    let (host, port) = match parse_authority(&head.target) {
        Ok(authority) => authority,
        Err(e) => {
            reply_error(&mut client, 400, "Bad Request").await;
            return Err(e);
        }
    };

    let Some(certificates) = &ctx.certificates else {
        return tunnel(client, &host, port, ctx).await;
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    let config = certificates.server_config(&host)?;
    let tls = TlsAcceptor::from(config)
        .accept(client)
        .await
        .map_err(|e| PermDumpError::Tls(format!("Client handshake for {} failed: {}", host, e)))?;
    debug!("Intercepting TLS to {}:{}", host, port);

    serve_requests(
        BufReader::new(tls),
        peer,
        Origin::Tunnel { host, port },
        None,
        ctx,
    )
    .await
}

/// Relay a CONNECT tunnel without looking inside.
async fn tunnel(
    mut client: BufReader<TcpStream>,
    host: &str,
    port: u16,
    ctx: &ProxyContext,
) -> Result<()> {
    info!("CONNECT tunnel to {}:{}", host, port);
    let mut remote = match connect_upstream(host, port, ctx).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to connect to {}:{}: {}", host, port, e);
            reply_error(&mut client, 502, "Bad Gateway").await;
            return Ok(());
        }
    };
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
        Ok((up, down)) => debug!(
            "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
            host, port, up, down
        ),
        Err(e) => debug!("Tunnel to {}:{} ended: {}", host, port, e),
    }
    Ok(())
}

/// Read requests off a client connection, forward each one and relay the
/// responses until either side closes.
async fn serve_requests<S>(
    mut client: BufReader<S>,
    peer: SocketAddr,
    origin: Origin,
    mut pending: Option<RequestHead>,
    ctx: &ProxyContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head = match pending.take() {
            Some(head) => head,
            None => match http::read_request_head(&mut client).await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(()),
                Err(e) => {
                    reply_error(&mut client, 400, "Bad Request").await;
                    return Err(e);
                }
            },
        };
        let keep_alive = head.keep_alive();

        let request = match read_request(&mut client, &head, &origin).await {
            Ok(request) => request,
            Err(e) => {
                reply_error(&mut client, 400, "Bad Request").await;
                return Err(e);
            }
        };

        let mut flow = Flow::new(ctx.next_flow_id(), Some(peer), request);
        ctx.addons.request(&flow);

        let response = match forward(&flow.request, ctx).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream error for {}: {}", flow.request.url(), e);
                reply_error(&mut client, 502, "Bad Gateway").await;
                return Ok(());
            }
        };
        info!(
            "{} {} -> {}",
            flow.request.method,
            flow.request.url(),
            response.status_code
        );

        let encoded = http::encode_response(&response, &flow.request.method, keep_alive);
        flow.response = Some(response);
        ctx.addons.response(&flow);

        client.write_all(&encoded).await?;
        client.flush().await?;
        if !keep_alive {
            return Ok(());
        }
    }
}

/// Read the request body and resolve the request target.
async fn read_request<S>(
    client: &mut BufReader<S>,
    head: &RequestHead,
    origin: &Origin,
) -> Result<FlowRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (scheme, host, port, path) = match origin {
        Origin::Absolute => {
            let scheme = if head.target.starts_with("https://") {
                "https"
            } else if head.target.starts_with("http://") {
                "http"
            } else {
                return Err(PermDumpError::Http(format!(
                    "Expected an absolute URI, got {:?}",
                    head.target
                )));
            };
            let (host, port) = parse_host_port(&head.target)?;
            (scheme, host, port, parse_path(&head.target))
        }
        Origin::Tunnel { host, port } => ("https", host.clone(), *port, head.target.clone()),
    };

    let content = http::read_request_body(client, &head.headers).await?;
    Ok(FlowRequest {
        timestamp: Utc::now(),
        method: head.method.clone(),
        scheme: scheme.to_string(),
        host,
        port,
        path,
        http_version: head.version.clone(),
        headers: head.headers.clone(),
        content,
    })
}

/// Send a request upstream on a fresh connection and read back the response.
async fn forward(request: &FlowRequest, ctx: &ProxyContext) -> Result<FlowResponse> {
    let tcp = connect_upstream(&request.host, request.port, ctx).await?;
    if request.scheme == "https" {
        let tls = ctx.upstream.connect(&request.host, tcp).await?;
        round_trip(tls, request).await
    } else {
        round_trip(tcp, request).await
    }
}

async fn round_trip<S>(mut upstream: S, request: &FlowRequest) -> Result<FlowResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    upstream.write_all(&http::encode_request(request)).await?;
    upstream.flush().await?;

    let mut reader = BufReader::new(upstream);
    let head = http::read_response_head(&mut reader).await?;
    let content = http::read_response_body(&mut reader, &request.method, &head).await?;
    Ok(FlowResponse {
        timestamp: Utc::now(),
        status_code: head.status_code,
        reason: head.reason,
        http_version: head.version,
        headers: head.headers,
        content,
    })
}

async fn connect_upstream(host: &str, port: u16, ctx: &ProxyContext) -> Result<TcpStream> {
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    tokio::time::timeout(ctx.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| PermDumpError::Proxy(format!("Timed out connecting to {}", addr)))?
        .map_err(PermDumpError::from)
}

/// Best-effort error reply; the connection is closed afterwards either way.
async fn reply_error<W>(client: &mut W, status_code: u16, reason: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = client
        .write_all(&http::error_response(status_code, reason))
        .await
    {
        debug!("Failed to send {} to client: {}", status_code, e);
    }
    let _ = client.flush().await;
}

/// Split a `host:port` authority. IPv6 hosts are bracketed.
fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let invalid = || PermDumpError::Http(format!("Invalid authority: {:?}", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        return Ok((host.to_string(), port.parse().map_err(|_| invalid())?));
    }
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
}

/// Parse host and port from an absolute URI like "http://example.com:8080/path"
fn parse_host_port(uri: &str) -> Result<(String, u16)> {
    let is_https = uri.starts_with("https://");
    let default_port: u16 = if is_https { 443 } else { 80 };

    let host_port = strip_scheme(uri).split('/').next().unwrap_or_default();
    let host_port = host_port.split('?').next().unwrap_or_default();
    if host_port.is_empty() {
        return Err(PermDumpError::Http(format!("No host in {:?}", uri)));
    }

    let has_port = match host_port.rfind(':') {
        Some(pos) => !host_port[pos..].contains(']'),
        None => false,
    };
    if has_port {
        parse_authority(host_port)
    } else {
        let host = host_port.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), default_port))
    }
}

/// Parse the path from an absolute URI
fn parse_path(uri: &str) -> String {
    let without_scheme = strip_scheme(uri);
    match without_scheme.find(['/', '?']) {
        Some(pos) if without_scheme[pos..].starts_with('?') => {
            format!("/{}", &without_scheme[pos..])
        }
        Some(pos) => without_scheme[pos..].to_string(),
        None => "/".to_string(),
    }
}

fn strip_scheme(uri: &str) -> &str {
    uri.strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
        .unwrap_or(uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_scheme() {
        let (host, port) = parse_host_port("http://example.com/path").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_host_port_with_explicit_port() {
        let (host, port) = parse_host_port("http://vcenter.local:8080/sdk").unwrap();
        assert_eq!(host, "vcenter.local");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_parse_host_port_https() {
        let (host, port) = parse_host_port("https://vcenter.local/sdk").unwrap();
        assert_eq!(host, "vcenter.local");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        assert_eq!(
            parse_host_port("http://[::1]:8080/sdk").unwrap(),
            ("::1".to_string(), 8080)
        );
        assert_eq!(
            parse_host_port("http://[::1]/sdk").unwrap(),
            ("::1".to_string(), 80)
        );
    }

    #[test]
    fn test_parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("http://vcenter.local:http/").is_err());
        assert!(parse_host_port("http:///sdk").is_err());
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("http://example.com/foo/bar"), "/foo/bar");
        assert_eq!(parse_path("http://example.com"), "/");
        assert_eq!(parse_path("http://example.com?x=1"), "/?x=1");
        assert_eq!(parse_path("https://vcenter.local/sdk/vimService"), "/sdk/vimService");
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            parse_authority("vcenter.local:443").unwrap(),
            ("vcenter.local".to_string(), 443)
        );
        assert_eq!(
            parse_authority("[fe80::1]:8443").unwrap(),
            ("fe80::1".to_string(), 8443)
        );
        assert!(parse_authority("vcenter.local").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("vcenter.local:99999").is_err());
    }

    #[tokio::test]
    async fn absolute_form_request_is_resolved() {
        let head = RequestHead {
            method: "POST".to_string(),
            target: "http://vcenter.local:8080/sdk".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: [("Content-Length".to_string(), "2".to_string())]
                .into_iter()
                .collect(),
        };
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"ok").await.unwrap();
        let mut reader = BufReader::new(client);
        let request = read_request(&mut reader, &head, &Origin::Absolute)
            .await
            .unwrap();
        assert_eq!(request.scheme, "http");
        assert_eq!(request.host, "vcenter.local");
        assert_eq!(request.port, 8080);
        assert_eq!(request.path, "/sdk");
        assert_eq!(request.content, b"ok");
    }

    #[tokio::test]
    async fn origin_form_request_needs_a_tunnel() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "/sdk".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Default::default(),
        };
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(client);
        assert!(read_request(&mut reader, &head, &Origin::Absolute)
            .await
            .is_err());

        let tunnel = Origin::Tunnel {
            host: "vcenter.local".to_string(),
            port: 443,
        };
        let request = read_request(&mut reader, &head, &tunnel).await.unwrap();
        assert_eq!(request.url(), "https://vcenter.local/sdk");
    }
}
