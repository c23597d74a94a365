//! 异步双向字节流抽象
//!
//! 所有会话都建立在 [`Channel`] 之上：TCP 套接字、UDP "连接" 以及包装任意
//! Channel 的 TLS 会话。同一种操作同一时刻最多只有一个在途（一个读和一个写
//! 可以并发，两个读不行），`close()` 幂等、不阻塞，并会以 "closed" 失败结束
//! 所有在途操作。

mod reader;
mod tcp;
mod tls;
mod udp;

pub use reader::ChannelReader;
pub use tcp::TcpChannel;
pub use tls::{TlsRole, TlsSession, TlsState, MAX_CIPHERTEXT_LEN, MAX_PLAINTEXT_LEN};
pub use udp::UdpChannel;

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

/// 异步双向字节流
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// 读取数据到 `buf`，返回读取的字节数
    ///
    /// 返回 `Ok(0)` 表示对端有序关闭。空缓冲区返回 `InvalidArgument`，
    /// 已有读操作在途时返回 `InvalidState`。
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// 写出整个 `buf`，全部写完后才返回
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// 关闭 Channel（幂等，可在任意任务中调用，包括完成回调内部）
    fn close(&self);

    /// 是否已关闭
    fn is_closed(&self) -> bool;

    /// 本地端点
    fn local_addr(&self) -> Option<SocketAddr>;

    /// 对端端点
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// 在读写路径之间共享的 Channel 引用
pub type SharedChannel = Arc<dyn Channel>;

/// 格式化可选地址用于日志
pub(crate) fn display_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 分配一个清零的读缓冲区；分配失败只让当前操作失败
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| ProxyError::out_of_memory(format!("{} byte buffer: {}", len, e)))?;
    buf.resize(len, 0);
    Ok(buf)
}
