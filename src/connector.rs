//! 上游连接：解析目标地址并建立 Channel
use crate::addr::TargetAddr;
use crate::channel::{SharedChannel, TcpChannel, TlsSession};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use rustls::ClientConfig;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info, warn};

/// 连接上游的接缝，测试中可替换
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// 连接到目标；目标在连接完成后即被丢弃
    async fn connect(&self, target: &TargetAddr) -> Result<SharedChannel>;
}

/// 解析目标为候选地址列表
pub async fn resolve(target: &TargetAddr) -> Result<Vec<SocketAddr>> {
    match target {
        TargetAddr::Ip(addr) => Ok(vec![*addr]),
        TargetAddr::Domain(host, port) => {
            let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| ProxyError::upstream(target.to_string(), e))?
                .collect();
            if addrs.is_empty() {
                return Err(ProxyError::upstream(target.to_string(), "no addresses resolved"));
            }
            Ok(addrs)
        }
    }
}

/// 直连 TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive: Duration::from_secs(60),
        }
    }

    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::timeout(self.connect_timeout))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        apply_keepalive(&stream, self.keepalive);
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &TargetAddr) -> Result<SharedChannel> {
        let addrs = resolve(target).await?;
        let mut last_error = None;

        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    info!("Connected to upstream {} ({})", target, addr);
                    return Ok(Arc::new(TcpChannel::new(stream)));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(connect_failure(target, last_error))
    }
}

/// 所有候选地址都失败后的错误；最后一次是超时则原样上报（会话据此回 504）
fn connect_failure(target: &TargetAddr, last_error: Option<ProxyError>) -> ProxyError {
    match last_error {
        Some(e) if e.is_timeout() => {
            warn!("Upstream {} timed out: {}", target, e);
            e
        }
        last_error => {
            let reason = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses to try".to_string());
            warn!("Upstream {} unreachable: {}", target, reason);
            ProxyError::upstream(target.to_string(), reason)
        }
    }
}

/// 在内层连接之上完成 TLS 客户端握手
///
/// 握手受 `handshake_timeout` 约束，超时后关闭内层连接并返回 `Timeout`。
pub struct TlsConnector {
    inner: Arc<dyn Connector>,
    config: Arc<ClientConfig>,
    sni: Option<String>,
    handshake_timeout: Duration,
}

impl TlsConnector {
    pub fn new(
        inner: Arc<dyn Connector>,
        config: Arc<ClientConfig>,
        sni: Option<String>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            config,
            sni,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, target: &TargetAddr) -> Result<SharedChannel> {
        let host = self.sni.clone().unwrap_or_else(|| target.host());
        let name = crate::tls::server_name(&host)?;
        let channel = self.inner.connect(target).await?;
        let handshake = TlsSession::connect(channel.clone(), self.config.clone(), name);
        match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(session)) => Ok(Arc::new(session)),
            Ok(Err(e)) => Err(ProxyError::upstream(target.to_string(), e)),
            Err(_) => {
                warn!(
                    "TLS handshake with {} timed out after {:?}",
                    target, self.handshake_timeout
                );
                channel.close();
                Err(ProxyError::timeout(self.handshake_timeout))
            }
        }
    }
}

fn apply_keepalive(stream: &TcpStream, time: Duration) {
    let keepalive = TcpKeepalive::new().with_time(time);
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}
