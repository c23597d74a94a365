//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use session_proxy::addr::TargetAddr;
use session_proxy::channel::SharedChannel;
use session_proxy::config::{ListenerProtocol, ServerConfig, ServiceConfig, TlsCertConfig};
use session_proxy::connector::{Connector, TcpConnector};
use session_proxy::registry::ServiceContext;
use session_proxy::server::TcpServer;
use session_proxy::stats::ServiceStatsTracker;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use session_proxy::tls;
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

/// Spawn a TCP server running `handler` for every accepted connection
pub async fn spawn_server<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handler(socket));
        }
    });
    addr
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    spawn_server(|mut socket| async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
    .await
}

/// Echo server that first announces the peer address it sees
pub async fn start_peer_reporting_echo_server() -> SocketAddr {
    spawn_server(|mut socket| async move {
        let peer = socket.peer_addr().unwrap().to_string();
        if socket.write_all(format!("{}\n", peer).as_bytes()).await.is_err() {
            return;
        }
        let mut buf = vec![0u8; 8192];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
    .await
}

/// An HTTP/1.1 message read by [`HttpStream`]
#[derive(Debug, Clone)]
pub struct Message {
    pub head: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn start_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }

    pub fn status(&self) -> u16 {
        self.start_line()
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Minimal HTTP framing over a test socket: Content-Length or chunked bodies
pub struct HttpStream {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl HttpStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.expect("Failed to connect"))
    }

    pub async fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.expect("Failed to write");
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[..pos]).to_string();
                self.buf.drain(..pos + 2);
                return Some(line);
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    async fn read_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buf.len() < n {
            if !self.fill().await {
                return None;
            }
        }
        Some(self.buf.drain(..n).collect())
    }

    /// Read the next message; `None` when the peer closed first
    pub async fn next_message(&mut self) -> Option<Message> {
        let mut head = String::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            head.push_str(&line);
            head.push_str("\r\n");
        }
        let mut message = Message {
            head,
            body: Vec::new(),
        };

        let chunked = message
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            loop {
                let size_line = self.read_line().await?;
                let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
                if size == 0 {
                    while !self.read_line().await?.is_empty() {}
                    break;
                }
                let data = self.read_exact(size).await?;
                message.body.extend_from_slice(&data);
                self.read_line().await?;
            }
        } else if let Some(len) = message.header("content-length") {
            let len: usize = len.parse().ok()?;
            message.body = self.read_exact(len).await?;
        }
        Some(message)
    }

    /// Read whatever arrives until the peer closes
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        while self.fill().await {}
        std::mem::take(&mut self.buf)
    }

    /// Bytes received beyond the last parsed message
    pub async fn read_raw(&mut self, n: usize) -> Option<Vec<u8>> {
        self.read_exact(n).await
    }
}

/// Connector wrapper that counts connects and records targets
pub struct CountingConnector {
    inner: TcpConnector,
    connects: AtomicUsize,
    targets: Mutex<Vec<TargetAddr>>,
}

impl CountingConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: TcpConnector::new(Duration::from_secs(2)),
            connects: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, target: &TargetAddr) -> session_proxy::Result<SharedChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(target.clone());
        self.inner.connect(target).await
    }
}

pub fn server_config(service: &str, tls: Option<(PathBuf, PathBuf)>) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: 0,
        protocol: ListenerProtocol::Tcp,
        service: service.to_string(),
        tls: tls.map(|(cert_path, key_path)| TlsCertConfig {
            cert_path,
            key_path,
        }),
        rate_limit: None,
    }
}

/// Start a tcp listener for `service`, returning its address and context
pub async fn start_service(
    service: ServiceConfig,
    connector: Arc<dyn Connector>,
) -> (SocketAddr, Arc<ServiceContext>) {
    start_service_with(server_config(&service.id.clone(), None), service, connector).await
}

pub async fn start_service_with(
    server: ServerConfig,
    service: ServiceConfig,
    connector: Arc<dyn Connector>,
) -> (SocketAddr, Arc<ServiceContext>) {
    let stats = ServiceStatsTracker::new(service.id.clone());
    let ctx = Arc::new(ServiceContext::new(service, connector, stats).expect("Invalid service"));
    let listener = TcpServer::bind(&server, ctx.clone())
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    (addr, ctx)
}
