use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use permdump::addon::permission::PermissionRecorder;
use permdump::addon::AddonManager;
use permdump::config::CaptureConfig;
use permdump::flow::io::FlowReader;
use permdump::proxy::http;
use permdump::proxy::tls::{CertificateManager, UpstreamConnector};
use permdump::proxy::ProxyServer;

const NO_PERMISSION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <soapenv:Body>
    <soapenv:Fault>
      <faultcode>ServerFaultCode</faultcode>
      <faultstring>Permission to perform this operation was denied.</faultstring>
      <detail>
        <NoPermissionFault xmlns="urn:vim25" xsi:type="NoPermission">
          <object type="VirtualMachine">vm-1042</object>
          <privilegeId>VirtualMachine.Interact.PowerOn</privilegeId>
        </NoPermissionFault>
      </detail>
    </soapenv:Fault>
  </soapenv:Body>
</soapenv:Envelope>"#;

const CSV_HEADER: &str = "UserAgent,ObjectType,ObjectName,PrivilegeMissing";

/// A recorder writing into a temporary directory.
struct Capture {
    dir: tempfile::TempDir,
    recorder: Arc<PermissionRecorder>,
    addons: Arc<AddonManager>,
}

impl Capture {
    fn new(duplicates: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig {
            dump_flows: dir.path().join("flows.jsonl").to_string_lossy().into_owned(),
            dump_csv: dir.path().join("failures.csv").to_string_lossy().into_owned(),
            duplicates,
        };
        let recorder = Arc::new(PermissionRecorder::new(config));
        let mut addons = AddonManager::new();
        addons.add(recorder.clone());
        addons.running().unwrap();
        Self {
            dir,
            recorder,
            addons: Arc::new(addons),
        }
    }

    fn csv(&self) -> String {
        std::fs::read_to_string(self.dir.path().join("failures.csv")).unwrap()
    }

    fn flow_count(&self) -> usize {
        FlowReader::open(&self.dir.path().join("flows.jsonl"))
            .unwrap()
            .count()
    }
}

async fn start_proxy(capture: &Capture) -> SocketAddr {
    ProxyServer::new("127.0.0.1:0".to_string())
        .with_addons(capture.addons.clone())
        .start()
        .await
        .unwrap()
}

/// Answer one request per connection with a fixed status and body.
async fn serve_fixed<S>(stream: S, status: &str, body: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Ok(Some(head)) = http::read_request_head(&mut reader).await else {
        return;
    };
    if http::read_request_body(&mut reader, &head.headers).await.is_err() {
        return;
    }
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/xml; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let stream = reader.get_mut();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn spawn_upstream(status: &'static str, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_fixed(stream, status, body));
        }
    });
    addr
}

/// An address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn soap_post(target: &str, host: &SocketAddr, user_agent: &str) -> String {
    let body = "<soapenv:Envelope/>";
    format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        target,
        host,
        user_agent,
        body.len(),
        body
    )
}

/// Helper: connect to the proxy and send a raw HTTP request
async fn send_raw_request(proxy_addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

/// Send CONNECT and consume the proxy's reply head.
async fn open_tunnel(proxy_addr: SocketAddr, target: &str) -> (BufReader<TcpStream>, String) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let req = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap() == 0 || line == "\r\n" {
            break;
        }
    }
    (reader, status)
}

#[tokio::test]
async fn records_permission_fault_over_plain_http() {
    let upstream = spawn_upstream("500 Internal Server Error", NO_PERMISSION).await;
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let target = format!("http://{}/sdk", upstream);
    let response = send_raw_request(proxy, &soap_post(&target, &upstream, "pyvmomi/8.0")).await;

    assert!(
        response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
        "got: {}",
        response
    );
    assert!(response.contains("<privilegeId>VirtualMachine.Interact.PowerOn</privilegeId>"));

    capture.addons.done();
    let csv = capture.csv();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(
        lines[1],
        "pyvmomi/8.0,VirtualMachine,vm-1042,VirtualMachine.Interact.PowerOn"
    );
    assert_eq!(capture.flow_count(), 1);
    assert_eq!(capture.recorder.summary().recorded, 1);
}

#[tokio::test]
async fn repeated_fault_is_recorded_once() {
    let upstream = spawn_upstream("500 Internal Server Error", NO_PERMISSION).await;
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let target = format!("http://{}/sdk", upstream);
    for _ in 0..3 {
        send_raw_request(proxy, &soap_post(&target, &upstream, "govc/0.37")).await;
    }
    send_raw_request(proxy, &soap_post(&target, &upstream, "terraform")).await;

    capture.addons.done();
    let summary = capture.recorder.summary();
    assert_eq!(summary.recorded, 2);
    assert_eq!(summary.duplicates_skipped, 2);
    assert_eq!(capture.csv().lines().count(), 3);
}

#[tokio::test]
async fn duplicates_option_keeps_every_occurrence() {
    let upstream = spawn_upstream("500 Internal Server Error", NO_PERMISSION).await;
    let capture = Capture::new(true);
    let proxy = start_proxy(&capture).await;

    let target = format!("http://{}/sdk", upstream);
    for _ in 0..2 {
        send_raw_request(proxy, &soap_post(&target, &upstream, "govc/0.37")).await;
    }

    capture.addons.done();
    assert_eq!(capture.csv().lines().count(), 3);
    assert_eq!(capture.flow_count(), 2);
}

#[tokio::test]
async fn successful_response_is_not_recorded() {
    let upstream = spawn_upstream("200 OK", NO_PERMISSION).await;
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let target = format!("http://{}/sdk", upstream);
    let response = send_raw_request(proxy, &soap_post(&target, &upstream, "pyvmomi")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    capture.addons.done();
    assert_eq!(capture.csv().trim_end(), CSV_HEADER);
    assert_eq!(capture.flow_count(), 0);
}

#[tokio::test]
async fn keep_alive_serves_several_requests() {
    let upstream = spawn_upstream("200 OK", "<ok/>").await;
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://{}/sdk HTTP/1.1\r\nHost: {}\r\n\r\n",
        upstream, upstream
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut reader = BufReader::new(stream);
    for _ in 0..2 {
        let head = http::read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.status_code, 200);
        assert_eq!(head.headers.get("connection"), Some("keep-alive"));
        let body = http::read_response_body(&mut reader, "GET", &head)
            .await
            .unwrap();
        assert_eq!(body, b"<ok/>");
    }
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let response = send_raw_request(proxy, "NONSENSE\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", response);
}

#[tokio::test]
async fn origin_form_request_gets_400() {
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let response = send_raw_request(proxy, "GET /sdk HTTP/1.1\r\nHost: vc\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", response);
}

#[tokio::test]
async fn unreachable_upstream_gets_502() {
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;
    let dead = closed_port().await;

    let request = format!("GET http://{}/sdk HTTP/1.1\r\nHost: {}\r\n\r\n", dead, dead);
    let response = send_raw_request(proxy, &request).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "got: {}", response);
}

#[tokio::test]
async fn connect_without_interception_is_tunneled() {
    let upstream = spawn_upstream("500 Internal Server Error", NO_PERMISSION).await;
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;

    let (mut tunnel, status) = open_tunnel(proxy, &upstream.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"), "got: {}", status);

    let request = soap_post("/sdk", &upstream, "pyvmomi");
    tunnel.get_mut().write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tunnel.read_to_string(&mut response).await.unwrap();
    assert!(response.contains("NoPermissionFault"));

    // Blind tunnels are never inspected
    capture.addons.done();
    assert_eq!(capture.recorder.summary().recorded, 0);
}

#[tokio::test]
async fn connect_to_unreachable_host_gets_502() {
    let capture = Capture::new(false);
    let proxy = start_proxy(&capture).await;
    let dead = closed_port().await;

    let (_tunnel, status) = open_tunnel(proxy, &dead.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 502"), "got: {}", status);
}

/// A vCenter stand-in behind TLS, signed by its own CA. Returns its address
/// and that CA's certificate.
async fn spawn_tls_upstream() -> (SocketAddr, CertificateDer<'static>) {
    let upstream_dir = tempfile::tempdir().unwrap();
    let upstream_certs = CertificateManager::load_or_create(upstream_dir.path()).unwrap();
    let acceptor = TlsAcceptor::from(upstream_certs.server_config("127.0.0.1").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    serve_fixed(tls, "500 Internal Server Error", NO_PERMISSION).await;
                }
            });
        }
    });
    (upstream, upstream_certs.ca_cert_der().clone())
}

/// Start an intercepting proxy with the given upstream connector.
async fn start_intercepting_proxy(
    capture: &Capture,
    upstream: UpstreamConnector,
) -> (SocketAddr, Arc<CertificateManager>, tempfile::TempDir) {
    let proxy_dir = tempfile::tempdir().unwrap();
    let proxy_certs = Arc::new(CertificateManager::load_or_create(proxy_dir.path()).unwrap());
    let proxy = ProxyServer::new("127.0.0.1:0".to_string())
        .with_addons(capture.addons.clone())
        .with_certificates(proxy_certs.clone())
        .with_upstream(upstream)
        .start()
        .await
        .unwrap();
    (proxy, proxy_certs, proxy_dir)
}

/// POST a SOAP request through a CONNECT tunnel, trusting only the proxy CA.
async fn post_through_tunnel(
    proxy: SocketAddr,
    proxy_certs: &CertificateManager,
    upstream: SocketAddr,
) -> (http::ResponseHead, Vec<u8>) {
    let (tunnel, status) = open_tunnel(proxy, &upstream.to_string()).await;
    assert!(status.starts_with("HTTP/1.1 200"), "got: {}", status);

    let mut roots = RootCertStore::empty();
    roots.add(proxy_certs.ca_cert_der().clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).unwrap();
    let mut tls = connector
        .connect(server_name, tunnel.into_inner())
        .await
        .unwrap();

    let request = soap_post("/sdk", &upstream, "pyvmomi/8.0");
    tls.write_all(request.as_bytes()).await.unwrap();
    let mut reader = BufReader::new(tls);
    let head = http::read_response_head(&mut reader).await.unwrap();
    let body = http::read_response_body(&mut reader, "POST", &head)
        .await
        .unwrap();
    (head, body)
}

#[tokio::test]
async fn records_permission_fault_inside_intercepted_tls() {
    let (upstream, _) = spawn_tls_upstream().await;
    let capture = Capture::new(false);
    let (proxy, proxy_certs, _proxy_dir) =
        start_intercepting_proxy(&capture, UpstreamConnector::new(true).unwrap()).await;

    let (head, body) = post_through_tunnel(proxy, &proxy_certs, upstream).await;
    assert_eq!(head.status_code, 500);
    assert!(String::from_utf8_lossy(&body).contains("NoPermissionFault"));

    capture.addons.done();
    let csv = capture.csv();
    assert!(
        csv.contains("pyvmomi/8.0,VirtualMachine,vm-1042,VirtualMachine.Interact.PowerOn"),
        "got: {}",
        csv
    );
    let flow = FlowReader::open(&capture.dir.path().join("flows.jsonl"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(flow.request.scheme, "https");
    assert_eq!(flow.request.port, upstream.port());
}

#[tokio::test]
async fn verified_upstream_with_trusted_ca_is_intercepted() {
    let (upstream, upstream_ca) = spawn_tls_upstream().await;
    let mut roots = RootCertStore::empty();
    roots.add(upstream_ca).unwrap();

    let capture = Capture::new(false);
    let (proxy, proxy_certs, _proxy_dir) =
        start_intercepting_proxy(&capture, UpstreamConnector::with_roots(roots).unwrap()).await;

    let (head, _) = post_through_tunnel(proxy, &proxy_certs, upstream).await;
    assert_eq!(head.status_code, 500);

    capture.addons.done();
    assert_eq!(capture.recorder.summary().recorded, 1);
    assert_eq!(capture.flow_count(), 1);
}

#[tokio::test]
async fn untrusted_upstream_certificate_gets_502() {
    let (upstream, _) = spawn_tls_upstream().await;
    let other_dir = tempfile::tempdir().unwrap();
    let other_ca = CertificateManager::load_or_create(other_dir.path())
        .unwrap()
        .ca_cert_der()
        .clone();
    let mut other_roots = RootCertStore::empty();
    other_roots.add(other_ca).unwrap();

    for connector in [
        UpstreamConnector::new(false).unwrap(),
        UpstreamConnector::with_roots(other_roots).unwrap(),
    ] {
        let capture = Capture::new(false);
        let (proxy, proxy_certs, _proxy_dir) = start_intercepting_proxy(&capture, connector).await;

        let (head, body) = post_through_tunnel(proxy, &proxy_certs, upstream).await;
        assert_eq!(head.status_code, 502);
        assert_eq!(head.reason, "Bad Gateway");
        assert!(body.is_empty());

        capture.addons.done();
        assert_eq!(capture.csv(), format!("{}\r\n", CSV_HEADER));
        assert_eq!(capture.recorder.summary().recorded, 0);
    }
}
