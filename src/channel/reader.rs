use super::SharedChannel;
use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};

const DEFAULT_CHUNK: usize = 16 * 1024;

/// 带缓冲的 Channel 读取器
///
/// 会话在解析报文头时往往会多读出后续数据（流水线请求、隧道首包），
/// 这些数据保留在缓冲区中，供下一阶段继续消费。
pub struct ChannelReader {
    channel: SharedChannel,
    buf: BytesMut,
    chunk: usize,
}

impl ChannelReader {
    pub fn new(channel: SharedChannel) -> Self {
        Self::with_chunk_size(channel, DEFAULT_CHUNK)
    }

    pub fn with_chunk_size(channel: SharedChannel, chunk: usize) -> Self {
        Self {
            channel,
            buf: BytesMut::with_capacity(chunk),
            chunk: chunk.max(1),
        }
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    /// 已缓冲但尚未消费的数据
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 从 Channel 再读一次，返回新读入的字节数（0 表示对端关闭）
    pub async fn fill(&mut self) -> Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + self.chunk, 0);
        match self.channel.read(&mut self.buf[start..]).await {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }

    /// 确保缓冲区中至少有 `n` 字节
    pub async fn fill_to(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(ProxyError::PeerClosed);
            }
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        self.fill_to(1).await?;
        let byte = self.buf[0];
        let _ = self.buf.split_to(1);
        Ok(byte)
    }

    pub async fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_exact(2).await?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        self.fill_to(n).await?;
        Ok(self.consume(n))
    }

    /// 读取以 NUL 结尾的字段（不含 NUL），超过 `max` 字节视为协议错误
    pub async fn read_until_nul(&mut self, max: usize) -> Result<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == 0) {
                let field = self.consume(scanned + pos);
                let _ = self.buf.split_to(1);
                return Ok(field);
            }
            scanned = self.buf.len();
            if scanned > max {
                return Err(ProxyError::protocol("NUL-terminated field too long"));
            }
            if self.fill().await? == 0 {
                return Err(ProxyError::PeerClosed);
            }
        }
    }

    /// 从缓冲区头部取出 `n` 字节
    pub fn consume(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// 取出全部缓冲数据
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}
