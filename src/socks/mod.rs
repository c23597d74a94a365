//! SOCKS4/4a/5 会话
//!
//! 首字节决定协议版本。握手阶段受空闲超时约束；连接成功后应答客户端，
//! 把握手期间多读到的客户端数据转发给上游，再把两个 Channel 交给隧道中继。

pub mod v4;
pub mod v5;

use crate::addr::TargetAddr;
use crate::channel::{ChannelReader, SharedChannel};
use crate::error::{ProxyError, Result};
use crate::registry::ServiceContext;
use crate::relay::Tunnel;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksPhase {
    /// 等待版本字节 / v5 方法协商
    Negotiate,
    /// 等待命令请求
    Request,
    Connecting,
    Tunnel,
    Closed,
}

async fn within<T>(idle: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(idle, fut)
        .await
        .map_err(|_| ProxyError::timeout(idle))?
}

struct SocksSession {
    ctx: Arc<ServiceContext>,
    reader: ChannelReader,
    phase: SocksPhase,
}

/// 运行一个 SOCKS 会话直到隧道结束或握手失败
pub async fn run_session(ctx: Arc<ServiceContext>, client: SharedChannel) -> Result<()> {
    let mut session = SocksSession {
        ctx,
        reader: ChannelReader::new(client.clone()),
        phase: SocksPhase::Negotiate,
    };
    let result = session.run().await;
    if let Err(e) = &result {
        warn!(phase = ?session.phase, error = %e, "socks handshake failed");
        if !e.is_peer_closed() && !e.is_timeout() {
            session.ctx.stats().record_error();
        }
    }
    client.close();
    session.phase = SocksPhase::Closed;
    result
}

impl SocksSession {
    fn client(&self) -> &SharedChannel {
        self.reader.channel()
    }

    async fn run(&mut self) -> Result<()> {
        let idle = self.ctx.idle_timeout();
        let version = within(idle, self.reader.read_u8()).await?;
        let upstream = match version {
            v4::VERSION => self.handshake_v4(idle).await?,
            v5::VERSION => self.handshake_v5(idle).await?,
            other => {
                return Err(ProxyError::protocol(format!(
                    "unsupported SOCKS version {:#04x}",
                    other
                )))
            }
        };
        let Some(upstream) = upstream else {
            return Ok(());
        };
        self.start_tunnel(upstream).await
    }

    async fn handshake_v4(&mut self, idle: Duration) -> Result<Option<SharedChannel>> {
        self.phase = SocksPhase::Request;
        let request = within(idle, v4::read_request(&mut self.reader)).await?;
        debug!(target_addr = %request.target, user_len = request.user_id.len(), "socks4 request");

        if request.command != v4::CMD_CONNECT {
            self.client()
                .write(&v4::reply(v4::REPLY_REJECTED, None))
                .await?;
            return Err(ProxyError::protocol(format!(
                "unsupported SOCKS4 command {:#04x}",
                request.command
            )));
        }

        match self.connect(request.target).await {
            Ok(upstream) => {
                let reply = v4::reply(v4::REPLY_GRANTED, upstream.local_addr());
                if let Err(e) = self.client().write(&reply).await {
                    upstream.close();
                    return Err(e);
                }
                Ok(Some(upstream))
            }
            Err(e) => {
                self.client()
                    .write(&v4::reply(v4::REPLY_REJECTED, None))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn handshake_v5(&mut self, idle: Duration) -> Result<Option<SharedChannel>> {
        if !within(idle, v5::read_methods(&mut self.reader)).await? {
            self.client()
                .write(&v5::method_reply(v5::METHOD_NONE_ACCEPTABLE))
                .await?;
            info!("socks5 client offered no acceptable method");
            return Ok(None);
        }
        self.client()
            .write(&v5::method_reply(v5::METHOD_NO_AUTH))
            .await?;

        self.phase = SocksPhase::Request;
        let target = match within(idle, v5::read_request(&mut self.reader)).await? {
            v5::Request::Connect(target) => target,
            v5::Request::Reject(code) => {
                self.client().write(&v5::reply(code, None)).await?;
                info!(code, "socks5 request rejected");
                return Ok(None);
            }
        };
        debug!(target_addr = %target, "socks5 request");

        match self.connect(target).await {
            Ok(upstream) => {
                let reply = v5::reply(v5::REP_SUCCEEDED, upstream.local_addr());
                if let Err(e) = self.client().write(&reply).await {
                    upstream.close();
                    return Err(e);
                }
                Ok(Some(upstream))
            }
            Err(e) => {
                self.client()
                    .write(&v5::reply(v5::REP_GENERAL_FAILURE, None))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    /// 连接目标；`target` 在连接尝试结束时（无论成败）被释放
    async fn connect(&mut self, target: TargetAddr) -> Result<SharedChannel> {
        self.phase = SocksPhase::Connecting;
        let result = self.ctx.connector().connect(&target).await;
        match &result {
            Ok(upstream) => info!(
                target_addr = %target,
                local = %crate::channel::display_addr(upstream.local_addr()),
                "upstream connected"
            ),
            Err(e) => warn!(target_addr = %target, error = %e, "upstream connect failed"),
        }
        drop(target);
        result
    }

    async fn start_tunnel(&mut self, upstream: SharedChannel) -> Result<()> {
        let early = self.reader.take_buffered();
        if !early.is_empty() {
            if let Err(e) = upstream.write(&early).await {
                upstream.close();
                return Err(e);
            }
        }
        self.phase = SocksPhase::Tunnel;
        let stats = Tunnel::bind_with_stats(
            self.client().clone(),
            upstream,
            Some(self.ctx.stats().clone()),
        )
        .wait()
        .await;
        debug!(up = stats.a_to_b, down = stats.b_to_a, "tunnel finished");
        Ok(())
    }
}
