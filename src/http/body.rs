//! 消息体转发：定长、chunked 重新成帧、读到关闭
use super::message::BodyLength;
use crate::channel::{Channel, ChannelReader};
use crate::error::{ProxyError, Result};
use bytes::{BufMut, BytesMut};
use std::time::Duration;

/// chunk 尺寸行与 trailer 行的最大长度
const MAX_LINE: usize = 8 * 1024;

/// 合并写出的阈值
const FLUSH_THRESHOLD: usize = 16 * 1024;

/// 转发的同时保留消息体副本，用于代理认证后的重放
#[derive(Debug)]
pub struct BodyTap {
    buf: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl BodyTap {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    fn record(&mut self, data: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            self.buf = BytesMut::new();
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// 完整保留的已发送字节；超出上限时为 `None`
    pub fn replay(&self) -> Option<&[u8]> {
        (!self.overflowed).then_some(&self.buf[..])
    }
}

/// 转发目的地：某个 Channel，或丢弃
struct BodySink<'a> {
    to: Option<&'a dyn Channel>,
    pending: BytesMut,
    tap: Option<&'a mut BodyTap>,
    total: u64,
}

impl<'a> BodySink<'a> {
    fn push(&mut self, data: &[u8]) {
        if let Some(tap) = self.tap.as_deref_mut() {
            tap.record(data);
        }
        self.total += data.len() as u64;
        if self.to.is_some() {
            self.pending.extend_from_slice(data);
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(to) = self.to {
            if !self.pending.is_empty() {
                to.write(&self.pending).await?;
                self.pending.clear();
            }
        }
        Ok(())
    }

    async fn flush_if_full(&mut self) -> Result<()> {
        if self.pending.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }
}

/// 先写出积压数据，再在空闲超时内从源读取
async fn fill(from: &mut ChannelReader, sink: &mut BodySink<'_>, idle: Duration) -> Result<usize> {
    sink.flush().await?;
    tokio::time::timeout(idle, from.fill())
        .await
        .map_err(|_| ProxyError::timeout(idle))?
}

async fn next_line(
    from: &mut ChannelReader,
    sink: &mut BodySink<'_>,
    idle: Duration,
) -> Result<BytesMut> {
    let mut scanned = 0;
    loop {
        if let Some(pos) = from.buffer()[scanned..].iter().position(|&b| b == b'\n') {
            let end = scanned + pos;
            let raw = from.consume(end + 1);
            let line = raw[..end].strip_suffix(b"\r").unwrap_or(&raw[..end]);
            return Ok(BytesMut::from(line));
        }
        scanned = from.buffered();
        if scanned > MAX_LINE {
            return Err(ProxyError::protocol("chunked framing line too long"));
        }
        if fill(from, sink, idle).await? == 0 {
            return Err(ProxyError::protocol("unexpected end of chunked body"));
        }
    }
}

/// 解析 chunk 尺寸行，忽略 chunk 扩展
pub fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let size = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| ProxyError::protocol("chunk size is not ascii"))?
        .trim();
    if size.is_empty() || size.len() > 16 || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProxyError::protocol(format!("invalid chunk size '{}'", size)));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| ProxyError::protocol(format!("invalid chunk size '{}'", size)))
}

async fn forward_exact(
    from: &mut ChannelReader,
    sink: &mut BodySink<'_>,
    mut remaining: u64,
    idle: Duration,
) -> Result<()> {
    while remaining > 0 {
        if from.buffered() == 0 && fill(from, sink, idle).await? == 0 {
            return Err(ProxyError::protocol(format!(
                "message body truncated, {} bytes missing",
                remaining
            )));
        }
        let take = remaining.min(from.buffered() as u64) as usize;
        let data = from.consume(take);
        sink.push(&data);
        remaining -= take as u64;
        sink.flush_if_full().await?;
    }
    Ok(())
}

/// 按 `length` 把消息体从 `from` 转发到 `to`（`None` 表示丢弃）
///
/// 定长消息体恰好转发声明的字节数，多余数据留在读取器中。chunked 消息体
/// 重新成帧：`{size:x}\r\n data \r\n … 0\r\n trailers \r\n`，丢弃 chunk 扩展。
/// 返回转发的字节数（含重新成帧的开销）。
pub async fn relay_body(
    from: &mut ChannelReader,
    to: Option<&dyn Channel>,
    length: BodyLength,
    idle: Duration,
    tap: Option<&mut BodyTap>,
) -> Result<u64> {
    let mut sink = BodySink {
        to,
        pending: BytesMut::new(),
        tap,
        total: 0,
    };

    match length {
        BodyLength::Empty => {}
        BodyLength::Fixed(n) => forward_exact(from, &mut sink, n, idle).await?,
        BodyLength::Chunked => loop {
            let line = next_line(from, &mut sink, idle).await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                let mut tail = BytesMut::from(&b"0\r\n"[..]);
                loop {
                    let trailer = next_line(from, &mut sink, idle).await?;
                    if trailer.is_empty() {
                        break;
                    }
                    if tail.len() + trailer.len() > super::message::MAX_HEAD_SIZE {
                        return Err(ProxyError::protocol("chunked trailers too large"));
                    }
                    tail.put_slice(&trailer);
                    tail.put_slice(b"\r\n");
                }
                tail.put_slice(b"\r\n");
                sink.push(&tail);
                break;
            }

            sink.push(format!("{:x}\r\n", size).as_bytes());
            forward_exact(from, &mut sink, size, idle).await?;
            if !next_line(from, &mut sink, idle).await?.is_empty() {
                return Err(ProxyError::protocol("missing CRLF after chunk data"));
            }
            sink.push(b"\r\n");
        },
        BodyLength::UntilClose => loop {
            if from.buffered() == 0 && fill(from, &mut sink, idle).await? == 0 {
                break;
            }
            let data = from.take_buffered();
            sink.push(&data);
            sink.flush_if_full().await?;
        },
    }

    sink.flush().await?;
    Ok(sink.total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TcpChannel;
    use std::sync::Arc;

    const IDLE: Duration = Duration::from_secs(2);

    /// 把 `input` 送入读取器，返回转发结果与输出字节
    async fn run(input: &'static [u8], length: BodyLength) -> (Result<u64>, Vec<u8>, Vec<u8>) {
        let (src_a, src_b) = tokio::io::duplex(64 * 1024);
        let feeder = TcpChannel::from_stream(src_a, None, None);
        tokio::spawn(async move {
            feeder.write(input).await.unwrap();
            feeder.close();
        });
        let mut from = ChannelReader::new(Arc::new(TcpChannel::from_stream(src_b, None, None)));

        let (dst_a, dst_b) = tokio::io::duplex(64 * 1024);
        let to = TcpChannel::from_stream(dst_a, None, None);
        let sink_end = TcpChannel::from_stream(dst_b, None, None);

        let result = relay_body(&mut from, Some(&to), length, IDLE, None).await;
        to.close();

        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match sink_end.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        from.fill().await.ok();
        (result, out, from.take_buffered().to_vec())
    }

    #[tokio::test]
    async fn test_fixed_length_exact() {
        let (result, out, rest) = run(b"helloGET /next", BodyLength::Fixed(5)).await;
        assert_eq!(result.unwrap(), 5);
        assert_eq!(out, b"hello");
        assert_eq!(rest, b"GET /next");
    }

    #[tokio::test]
    async fn test_fixed_length_truncated() {
        let (result, _, _) = run(b"hel", BodyLength::Fixed(5)).await;
        assert!(result.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_chunked_reframed() {
        let (result, out, _) = run(
            b"5;ext=1\r\nhello\r\n0006\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n",
            BodyLength::Chunked,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(
            out,
            b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_chunked_bad_size() {
        let (result, _, _) = run(b"zz\r\nhello\r\n0\r\n\r\n", BodyLength::Chunked).await;
        assert!(result.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_chunked_missing_crlf() {
        let (result, _, _) = run(b"5\r\nhelloXX0\r\n\r\n", BodyLength::Chunked).await;
        assert!(result.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_until_close() {
        let (result, out, _) = run(b"everything until eof", BodyLength::UntilClose).await;
        assert_eq!(result.unwrap(), 20);
        assert_eq!(out, b"everything until eof");
    }

    #[test]
    fn test_tap_limit() {
        let mut tap = BodyTap::new(4);
        tap.record(b"abc");
        assert_eq!(tap.replay(), Some(&b"abc"[..]));
        tap.record(b"de");
        assert_eq!(tap.replay(), None);
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size(b"1a").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"ff ; name=value").unwrap(), 255);
        assert!(parse_chunk_size(b"").is_err());
        assert!(parse_chunk_size(b"-1").is_err());
        assert!(parse_chunk_size(b"+1").is_err());
        assert!(parse_chunk_size(b"11111111111111111").is_err());
    }
}
