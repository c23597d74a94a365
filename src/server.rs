//! 监听器：接受入站连接或数据报并交给对应服务
//!
//! 会话引擎本身从不打开监听套接字，这里只是让二进制可以运行的薄外壳。

use crate::channel::{SharedChannel, TcpChannel, TlsSession};
use crate::config::{ListenerProtocol, ProxyConfig, ServerConfig};
use crate::error::ProxyError;
use crate::rate_limiter::RateLimiter;
use crate::registry::{ServiceContext, ServiceRegistry};
use crate::relay::datagram::DatagramRelay;
use anyhow::{Context, Result};
use rustls::ServerConfig as RustlsServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// TCP 监听器，可选在客户端侧终结 TLS
pub struct TcpServer {
    listener: TcpListener,
    ctx: Arc<ServiceContext>,
    tls: Option<Arc<RustlsServerConfig>>,
    limiter: Option<RateLimiter>,
}

impl TcpServer {
    pub async fn bind(config: &ServerConfig, ctx: Arc<ServiceContext>) -> Result<Self> {
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind tcp listener on {}", address))?;
        let tls = match &config.tls {
            Some(tls) => Some(crate::tls::load_server_config(&tls.cert_path, &tls.key_path)?),
            None => None,
        };
        Ok(Self {
            listener,
            ctx,
            tls,
            limiter: config.rate_limit.clone().map(RateLimiter::new),
        })
    }

    /// 直接指定 TLS 配置（测试用）
    pub fn with_tls(mut self, tls: Option<Arc<RustlsServerConfig>>) -> Self {
        self.tls = tls;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到监听套接字出错；每个连接一个会话任务
    pub async fn run(self) -> Result<()> {
        info!(
            "Service '{}' ({}) listening on {}{}",
            self.ctx.id(),
            self.ctx.kind(),
            self.local_addr()?,
            if self.tls.is_some() { " with TLS" } else { "" }
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            if let Some(limiter) = &self.limiter {
                if let Err(wait) = limiter.check() {
                    warn!(
                        "Rate limit exceeded, rejecting {} (retry after {:?})",
                        peer, wait
                    );
                    continue;
                }
            }

            let ctx = self.ctx.clone();
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let deadline = ctx.idle_timeout();
                let channel = match accept_channel(stream, tls, deadline).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        ctx.stats().record_error();
                        warn!("Handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                if let Err(e) = ctx.serve(channel).await {
                    debug!("Session from {} ended: {}", peer, e);
                }
            });
        }
    }
}

/// 包装入站连接；TLS 握手必须在 `deadline` 内完成，否则关闭连接
async fn accept_channel(
    stream: TcpStream,
    tls: Option<Arc<RustlsServerConfig>>,
    deadline: Duration,
) -> crate::error::Result<SharedChannel> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on inbound connection: {}", e);
    }
    let channel: SharedChannel = Arc::new(TcpChannel::new(stream));
    let Some(config) = tls else {
        return Ok(channel);
    };
    match tokio::time::timeout(deadline, TlsSession::accept(channel.clone(), config)).await {
        Ok(session) => Ok(Arc::new(session?)),
        Err(_) => {
            channel.close();
            Err(ProxyError::timeout(deadline))
        }
    }
}

/// UDP 监听器
pub struct UdpServer {
    relay: DatagramRelay,
}

impl UdpServer {
    pub async fn bind(config: &ServerConfig, ctx: Arc<ServiceContext>) -> Result<Self> {
        let address = config.bind_address();
        let socket = UdpSocket::bind(&address)
            .await
            .with_context(|| format!("Failed to bind udp listener on {}", address))?;
        let relay = DatagramRelay::new(ctx, socket)
            .with_rate_limiter(config.rate_limit.clone().map(RateLimiter::new));
        Ok(Self { relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.relay.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        info!("UDP listener on {}", self.local_addr()?);
        self.relay.run().await?;
        Ok(())
    }
}

/// 按配置启动所有监听器，直到 Ctrl+C 或某个监听器失败
pub async fn run(config: ProxyConfig) -> Result<()> {
    let registry = Arc::new(ServiceRegistry::from_config(&config)?);
    run_with_registry(&config, registry).await
}

pub async fn run_with_registry(config: &ProxyConfig, registry: Arc<ServiceRegistry>) -> Result<()> {
    let mut listeners = JoinSet::new();
    for server in &config.servers {
        let ctx = registry
            .get(&server.service)
            .with_context(|| format!("Unknown service '{}'", server.service))?;
        match server.protocol {
            ListenerProtocol::Tcp => {
                let listener = TcpServer::bind(server, ctx).await?;
                listeners.spawn(listener.run());
            }
            ListenerProtocol::Udp => {
                let listener = UdpServer::bind(server, ctx).await?;
                listeners.spawn(listener.run());
            }
        }
    }
    info!("{} listener(s) started (Press Ctrl+C to stop)", listeners.len());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = tokio::select! {
        _ = &mut shutdown => {
            info!("Received shutdown signal, stopping listeners...");
            Ok(())
        }
        Some(joined) = listeners.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Listener failed: {:#}", e);
                Err(e)
            }
            Err(e) => Err(anyhow::anyhow!("Listener task panicked: {}", e)),
        },
    };

    listeners.shutdown().await;
    for stats in registry.stats().get_all_stats() {
        info!(
            "Service '{}': {} sessions, {} bytes up, {} bytes down, {} errors",
            stats.service,
            stats.total_sessions,
            stats.bytes_upstream,
            stats.bytes_downstream,
            stats.errors
        );
    }
    result
}
