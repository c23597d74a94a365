use super::{display_addr, Channel};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 关闭时刷新写半部的最长等待时间
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 基于字节流的 Channel
///
/// 读写两半各自持有一把锁：`try_lock` 失败即说明同类操作已在途。
/// `close()` 取消所有在途操作，随后在后台任务中等待它们退出并释放底层流。
#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpChannel {
    /// 包装已连接的 TCP 流
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::from_parts(Box::new(reader), Box::new(writer), local_addr, peer_addr)
    }

    /// 包装任意双向流（测试中常用 `tokio::io::duplex`）
    pub fn from_stream<S>(
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(Box::new(reader), Box::new(writer), local_addr, peer_addr)
    }

    fn from_parts(
        reader: BoxedReader,
        writer: BoxedWriter,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                local_addr,
                peer_addr,
            }),
        }
    }
}

impl StreamInner {
    /// 等待在途操作退出后释放两半
    async fn teardown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;
        }
        self.reader.lock().await.take();
        trace!(peer = %display_addr(self.peer_addr), "stream released");
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(ProxyError::invalid_argument("read buffer is empty"));
        }
        if self.is_closed() {
            return Err(ProxyError::closed());
        }
        let mut guard = self
            .inner
            .reader
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a read is already outstanding"))?;
        let reader = guard.as_mut().ok_or_else(ProxyError::closed)?;

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ProxyError::closed()),
            result = reader.read(buf) => Ok(result?),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(ProxyError::closed());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self
            .inner
            .writer
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a write is already outstanding"))?;
        let writer = guard.as_mut().ok_or_else(ProxyError::closed)?;

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(ProxyError::closed()),
            result = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => {
                result?;
                Ok(buf.len())
            }
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        debug!(peer = %display_addr(self.inner.peer_addr), "channel closed");

        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.teardown().await });
            }
            Err(_) => {
                // 运行时已退出：只释放未被占用的一半，其余随 Arc 释放
                if let Ok(mut writer) = inner.writer.try_lock() {
                    writer.take();
                }
                if let Ok(mut reader) = inner.reader.try_lock() {
                    reader.take();
                }
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }
}
