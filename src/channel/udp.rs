use super::Channel;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 已 "连接" 到单一对端的 UDP Channel
///
/// 每次读返回一个完整数据报，每次写发送一个数据报。读到 0 字节表示收到空
/// 数据报，而不是对端关闭。
pub struct UdpChannel {
    socket: UdpSocket,
    read_gate: Mutex<()>,
    write_gate: Mutex<()>,
    closed: AtomicBool,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
}

impl UdpChannel {
    /// 绑定与目标同族的临时端口并连接到目标
    pub async fn connect(target: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket
            .connect(target)
            .await
            .map_err(|e| ProxyError::upstream(target.to_string(), e))?;
        Ok(Self::from_socket(socket, target))
    }

    /// 包装已连接的套接字
    pub fn from_socket(socket: UdpSocket, peer_addr: SocketAddr) -> Self {
        let local_addr = socket.local_addr().ok();
        Self {
            socket,
            read_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            local_addr,
            peer_addr,
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(ProxyError::invalid_argument("read buffer is empty"));
        }
        if self.is_closed() {
            return Err(ProxyError::closed());
        }
        let _gate = self
            .read_gate
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a read is already outstanding"))?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::closed()),
            result = self.socket.recv(buf) => Ok(result?),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(ProxyError::closed());
        }
        let _gate = self
            .write_gate
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a write is already outstanding"))?;

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ProxyError::closed()),
            result = self.socket.send(buf) => result?,
        };
        if sent != buf.len() {
            return Err(ProxyError::protocol(format!(
                "datagram truncated: sent {} of {} bytes",
                sent,
                buf.len()
            )));
        }
        Ok(sent)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        debug!(peer = %self.peer_addr, "udp channel closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_exchange() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let channel = UdpChannel::connect(echo_addr).await.unwrap();
        assert_eq!(channel.peer_addr(), Some(echo_addr));
        channel.write(b"ping").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(Some(from), channel.local_addr());
        echo.send_to(b"pong", from).await.unwrap();

        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_close_cancels_read() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel = std::sync::Arc::new(
            UdpChannel::connect(echo.local_addr().unwrap()).await.unwrap(),
        );

        let reader = channel.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        channel.close();
        channel.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_invalid_state());
    }
}
