//! 数据报中继
//!
//! 每个入站数据报是一个一次性会话：连接到服务的固定上游，发出负载，在空闲
//! 超时内等待一个应答，原样发回数据报来源地址，然后结束。

use crate::channel::{alloc_buffer, Channel, UdpChannel};
use crate::connector::resolve;
use crate::error::{ProxyError, Result};
use crate::rate_limiter::RateLimiter;
use crate::registry::ServiceContext;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info_span, warn, Instrument};

/// 单个数据报的最大长度
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// 处理一个数据报往返，返回发回来源的应答长度
pub async fn relay_datagram(
    ctx: Arc<ServiceContext>,
    listener: Arc<UdpSocket>,
    source: SocketAddr,
    payload: Bytes,
) -> Result<usize> {
    let id = uuid::Uuid::new_v4();
    let span = info_span!("datagram", %id, peer = %source, service = %ctx.id());

    async move {
        let _active = ctx.stats().session();
        let result = round_trip(&ctx, &listener, source, &payload).await;
        match &result {
            Ok(n) => debug!(request = payload.len(), reply = n, "datagram relayed"),
            Err(e) if e.is_timeout() => debug!("no reply before idle timeout"),
            Err(e) => {
                ctx.stats().record_error();
                warn!(error = %e, "datagram relay failed");
            }
        }
        result
    }
    .instrument(span)
    .await
}

async fn round_trip(
    ctx: &ServiceContext,
    listener: &UdpSocket,
    source: SocketAddr,
    payload: &[u8],
) -> Result<usize> {
    let target = ctx
        .upstream()
        .ok_or_else(|| ProxyError::invalid_state("udp service without upstream"))?;
    let addr = resolve(target)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProxyError::upstream(target.to_string(), "no addresses resolved"))?;

    let upstream = UdpChannel::connect(addr).await?;
    let idle = ctx.idle_timeout();
    let result = async {
        upstream.write(payload).await?;
        ctx.stats().add_bytes_upstream(payload.len() as u64);

        let mut buf = alloc_buffer(MAX_DATAGRAM_SIZE)?;
        let n = tokio::time::timeout(idle, upstream.read(&mut buf))
            .await
            .map_err(|_| ProxyError::timeout(idle))??;
        listener.send_to(&buf[..n], source).await?;
        ctx.stats().add_bytes_downstream(n as u64);
        Ok::<_, ProxyError>(n)
    }
    .await;
    upstream.close();
    result
}

/// 监听套接字上的数据报循环
pub struct DatagramRelay {
    ctx: Arc<ServiceContext>,
    socket: Arc<UdpSocket>,
    limiter: Option<RateLimiter>,
}

impl DatagramRelay {
    pub fn new(ctx: Arc<ServiceContext>, socket: UdpSocket) -> Self {
        Self {
            ctx,
            socket: Arc::new(socket),
            limiter: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Option<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 接收数据报并为每个数据报派生一个中继任务，直到套接字出错
    pub async fn run(&self) -> Result<()> {
        let mut buf = alloc_buffer(MAX_DATAGRAM_SIZE)?;
        loop {
            let (n, source) = self.socket.recv_from(&mut buf).await?;
            if let Some(limiter) = &self.limiter {
                if let Err(wait) = limiter.check() {
                    debug!(peer = %source, ?wait, "rate limited, dropping datagram");
                    continue;
                }
            }
            let payload = Bytes::copy_from_slice(&buf[..n]);
            tokio::spawn(relay_datagram(
                self.ctx.clone(),
                self.socket.clone(),
                source,
                payload,
            ));
        }
    }
}
