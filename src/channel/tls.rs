//! TLS 会话：在任意 [`Channel`] 之上运行 TLS 记录层
//!
//! 握手、记录解密和加密由 rustls 的底层 `Connection` 完成，本模块负责
//! 在内层 Channel 与 rustls 之间搬运记录：
//!
//! - 入站字节先进入密文累加器，按记录头做长度/版本检查后整条交给 rustls；
//! - 明文队列优先于新的 Channel 读取被消费；
//! - 写入按最大记录长度分片，所有分片的密文拼接成一次内层写；
//! - 握手后消息（如 KeyUpdate）在已建立状态下透明处理。

use super::{Channel, SharedChannel};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex as SyncMutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// 单条记录的最大明文长度
pub const MAX_PLAINTEXT_LEN: usize = 16 * 1024;

/// 单条记录的最大密文长度（明文 + 2048 字节扩展）
pub const MAX_CIPHERTEXT_LEN: usize = MAX_PLAINTEXT_LEN + 2048;

const RECORD_HEADER_LEN: usize = 5;
const READ_CHUNK: usize = 32 * 1024;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// TLS 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// 握手进行中
    Negotiating,
    /// 握手完成，可以收发应用数据
    Established,
    /// 已发送或收到 close_notify
    Closing,
    /// 已关闭
    Closed,
    /// 握手或记录处理失败
    Failed,
}

/// 会话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// 出站：作为 TLS 客户端连接上游
    Client,
    /// 入站：作为 TLS 服务端接受客户端
    Server,
}

/// 包装内层 Channel 的 TLS 会话，本身也是一个 [`Channel`]
#[derive(Clone)]
pub struct TlsSession {
    inner: Arc<TlsInner>,
}

struct TlsInner {
    channel: SharedChannel,
    role: TlsRole,
    conn: SyncMutex<Connection>,
    state: SyncMutex<TlsState>,
    /// 密文累加器与读缓冲；持有它即代表一个在途读
    read_state: Mutex<ReadState>,
    /// 保证一个在途写
    write_gate: Mutex<()>,
    /// 串行化 "取出密文 + 写内层"，保证记录顺序
    send_lock: Mutex<()>,
    close_requested: AtomicBool,
    max_fragment: usize,
}

struct ReadState {
    pending: BytesMut,
    scratch: Vec<u8>,
}

impl TlsSession {
    /// 作为客户端在 `channel` 上完成握手
    pub async fn connect(
        channel: SharedChannel,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        let max_fragment = config.max_fragment_size.unwrap_or(MAX_PLAINTEXT_LEN);
        let conn = ClientConnection::new(config, server_name)?;
        let session = Self::new(channel, conn.into(), TlsRole::Client, max_fragment);
        session.handshake().await?;
        Ok(session)
    }

    /// 作为服务端在 `channel` 上完成握手
    pub async fn accept(channel: SharedChannel, config: Arc<ServerConfig>) -> Result<Self> {
        let max_fragment = config.max_fragment_size.unwrap_or(MAX_PLAINTEXT_LEN);
        let conn = ServerConnection::new(config)?;
        let session = Self::new(channel, conn.into(), TlsRole::Server, max_fragment);
        session.handshake().await?;
        Ok(session)
    }

    fn new(channel: SharedChannel, mut conn: Connection, role: TlsRole, max_fragment: usize) -> Self {
        // 写入的明文总是立即被取走，不需要 rustls 的缓冲上限
        conn.set_buffer_limit(None);
        Self {
            inner: Arc::new(TlsInner {
                channel,
                role,
                conn: SyncMutex::new(conn),
                state: SyncMutex::new(TlsState::Negotiating),
                read_state: Mutex::new(ReadState {
                    pending: BytesMut::with_capacity(MAX_CIPHERTEXT_LEN),
                    scratch: vec![0u8; READ_CHUNK],
                }),
                write_gate: Mutex::new(()),
                send_lock: Mutex::new(()),
                close_requested: AtomicBool::new(false),
                max_fragment: max_fragment.clamp(1, MAX_PLAINTEXT_LEN),
            }),
        }
    }

    pub fn state(&self) -> TlsState {
        *self.inner.state.lock()
    }

    pub fn role(&self) -> TlsRole {
        self.inner.role
    }

    async fn handshake(&self) -> Result<()> {
        let result = self.negotiate().await;
        match &result {
            Ok(()) => {
                debug!(role = ?self.inner.role, "tls handshake complete");
            }
            Err(e) => {
                warn!(role = ?self.inner.role, error = %e, "tls handshake failed");
                self.inner.fail().await;
            }
        }
        result
    }

    async fn negotiate(&self) -> Result<()> {
        let mut rs = self.inner.read_state.lock().await;
        // 客户端的首个 ClientHello 在第一次 flush 时发出
        loop {
            self.inner.flush_pending().await?;
            if !self.inner.conn.lock().is_handshaking() {
                self.inner.set_state(TlsState::Established);
                return Ok(());
            }
            let ReadState { pending, scratch } = &mut *rs;
            if self.inner.ingest(pending)? {
                continue;
            }
            let n = self.inner.channel.read(scratch).await?;
            if n == 0 {
                return Err(ProxyError::protocol("connection closed during tls handshake"));
            }
            pending.extend_from_slice(&scratch[..n]);
        }
    }
}

impl TlsInner {
    fn set_state(&self, state: TlsState) {
        *self.state.lock() = state;
    }

    /// 把累加器中的完整记录交给 rustls 处理
    ///
    /// 返回是否消费了至少一条记录。出现可读明文后即停止，剩余记录留待下次。
    fn ingest(&self, pending: &mut BytesMut) -> Result<bool> {
        let mut progressed = false;
        let mut conn = self.conn.lock();
        while let Some(len) = next_record_len(pending)? {
            let mut record = &pending[..len];
            while !record.is_empty() {
                match conn.read_tls(&mut record) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if progressed => {
                        trace!(error = %e, "tls input deferred");
                        return Ok(true);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            let consumed = len - record.len();
            pending.advance(consumed);
            progressed = true;

            let io_state = conn.process_new_packets()?;
            if io_state.peer_has_closed() {
                let mut state = self.state.lock();
                if *state == TlsState::Established {
                    *state = TlsState::Closing;
                }
            }
            if io_state.plaintext_bytes_to_read() > 0 || consumed < len {
                break;
            }
        }
        Ok(progressed)
    }

    /// 取出 rustls 待发送的密文，写入内层 Channel
    async fn flush_pending(&self) -> Result<()> {
        let _send = self.send_lock.lock().await;
        let out = self.take_outgoing()?;
        if !out.is_empty() {
            self.channel.write(&out).await?;
        }
        Ok(())
    }

    fn take_outgoing(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut conn = self.conn.lock();
        while conn.wants_write() {
            conn.write_tls(&mut out)?;
        }
        Ok(out)
    }

    /// 失败：尽力发出告警后关闭内层 Channel
    async fn fail(&self) {
        self.set_state(TlsState::Failed);
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.flush_pending()).await;
        self.channel.close();
    }

    async fn record_failure(&self, err: ProxyError) -> ProxyError {
        if matches!(err, ProxyError::Tls(_) | ProxyError::Protocol(_)) {
            warn!(role = ?self.role, error = %err, "tls record processing failed");
            self.fail().await;
        }
        err
    }

    async fn shutdown(&self) {
        let flush = async {
            let _send = self.send_lock.lock().await;
            let out = {
                let mut conn = self.conn.lock();
                conn.send_close_notify();
                let mut out = Vec::new();
                while conn.wants_write() {
                    if conn.write_tls(&mut out).is_err() {
                        break;
                    }
                }
                out
            };
            if !out.is_empty() {
                let _ = self.channel.write(&out).await;
            }
        };
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
        self.set_state(TlsState::Closed);
        self.channel.close();
    }
}

/// 检查累加器头部的记录头，返回完整记录长度；数据不足时返回 `None`
fn next_record_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let content_type = buf[0];
    if !(20..=24).contains(&content_type) {
        return Err(ProxyError::protocol(format!(
            "unexpected tls content type {}",
            content_type
        )));
    }
    if buf[1] != 3 {
        return Err(ProxyError::protocol(format!(
            "unsupported tls record version {}.{}",
            buf[1], buf[2]
        )));
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if len > MAX_CIPHERTEXT_LEN {
        return Err(ProxyError::protocol(format!("tls record too large: {}", len)));
    }
    let total = RECORD_HEADER_LEN + len;
    Ok((buf.len() >= total).then_some(total))
}

#[async_trait]
impl Channel for TlsSession {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(ProxyError::invalid_argument("read buffer is empty"));
        }
        match self.state() {
            TlsState::Negotiating => {
                return Err(ProxyError::invalid_state("tls handshake not complete"))
            }
            TlsState::Closed | TlsState::Failed => return Err(ProxyError::closed()),
            TlsState::Established | TlsState::Closing => {}
        }
        let inner = &self.inner;
        let mut rs = inner
            .read_state
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a read is already outstanding"))?;

        loop {
            // 明文队列优先
            let plain = inner.conn.lock().reader().read(buf);
            match plain {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e.into()),
            }

            let ReadState { pending, scratch } = &mut *rs;
            match inner.ingest(pending) {
                Ok(true) => {
                    // 握手后消息可能产生需要回复的记录
                    inner.flush_pending().await?;
                    continue;
                }
                Ok(false) => {}
                Err(e) => return Err(inner.record_failure(e).await),
            }

            let n = inner.channel.read(scratch).await?;
            if n == 0 {
                trace!(role = ?inner.role, "inner channel closed without close_notify");
                return Ok(0);
            }
            pending.extend_from_slice(&scratch[..n]);
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        match self.state() {
            TlsState::Established => {}
            TlsState::Negotiating => {
                return Err(ProxyError::invalid_state("tls handshake not complete"))
            }
            _ => return Err(ProxyError::closed()),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let inner = &self.inner;
        let _gate = inner
            .write_gate
            .try_lock()
            .map_err(|_| ProxyError::invalid_state("a write is already outstanding"))?;
        let _send = inner.send_lock.lock().await;

        // 按记录长度分片，所有分片的密文合并为一次内层写
        let out = {
            let mut conn = inner.conn.lock();
            let mut out = Vec::with_capacity(buf.len() + buf.len() / 16 + 64);
            for fragment in buf.chunks(inner.max_fragment) {
                conn.writer().write_all(fragment)?;
                while conn.wants_write() {
                    conn.write_tls(&mut out)?;
                }
            }
            out
        };
        inner.channel.write(&out).await?;
        Ok(buf.len())
    }

    fn close(&self) {
        if self.inner.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state();
        if matches!(state, TlsState::Closed | TlsState::Failed) {
            self.inner.channel.close();
            return;
        }
        self.inner.set_state(TlsState::Closing);
        debug!(role = ?self.inner.role, "tls session closing");

        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { inner.shutdown().await });
            }
            Err(_) => {
                inner.set_state(TlsState::Closed);
                inner.channel.close();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.close_requested.load(Ordering::Acquire)
            || matches!(self.state(), TlsState::Closed | TlsState::Failed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.channel.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.channel.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TcpChannel;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::RootCertStore;

    fn test_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der: CertificateDer<'static> = cert.cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            cert.signing_key.serialize_der(),
        ));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (Arc::new(server), Arc::new(client))
    }

    async fn session_pair() -> (TlsSession, TlsSession) {
        let (server_cfg, client_cfg) = test_configs();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_channel: SharedChannel = Arc::new(TcpChannel::from_stream(a, None, None));
        let server_channel: SharedChannel = Arc::new(TcpChannel::from_stream(b, None, None));

        let name = ServerName::try_from("localhost").unwrap();
        let (client, server) = tokio::join!(
            TlsSession::connect(client_channel, client_cfg, name),
            TlsSession::accept(server_channel, server_cfg)
        );
        (client.unwrap(), server.unwrap())
    }

    #[test]
    fn test_record_header_checks() {
        assert_eq!(next_record_len(&[22, 3, 1, 0]).unwrap(), None);
        assert_eq!(next_record_len(&[22, 3, 3, 0, 2, 0]).unwrap(), None);
        assert_eq!(next_record_len(&[23, 3, 3, 0, 1, 0xaa]).unwrap(), Some(6));
        assert!(next_record_len(b"GET / HTTP/1.1").unwrap_err().is_protocol());
        assert!(next_record_len(&[22, 2, 0, 0, 1]).unwrap_err().is_protocol());
        assert!(next_record_len(&[23, 3, 3, 0xff, 0xff]).unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (client, server) = session_pair().await;
        assert_eq!(client.state(), TlsState::Established);
        assert_eq!(server.state(), TlsState::Established);
        assert_eq!(server.role(), TlsRole::Server);

        client.write(b"hello over tls").await.unwrap();
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over tls");
    }

    #[tokio::test]
    async fn test_large_write_is_fragmented() {
        let (client, server) = session_pair().await;
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = vec![0u8; 8192];
            while received.len() < expected.len() {
                let n = server.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        assert_eq!(client.write(&payload).await.unwrap(), payload.len());
        assert_eq!(reader.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_close_notify_reads_zero() {
        let (client, server) = session_pair().await;
        client.close();
        client.close();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(client.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_fails_on_garbage() {
        let (_, client_cfg) = test_configs();
        let (a, b) = tokio::io::duplex(4096);
        let client_channel: SharedChannel = Arc::new(TcpChannel::from_stream(a, None, None));
        let peer = TcpChannel::from_stream(b, None, None);

        let garbage = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let _ = peer.read(&mut buf).await;
            peer.write(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
            peer
        });

        let name = ServerName::try_from("localhost").unwrap();
        let err = TlsSession::connect(client_channel.clone(), client_cfg, name)
            .await
            .err()
            .unwrap();
        assert!(err.is_protocol());
        assert!(client_channel.is_closed());
        drop(garbage.await.unwrap());
    }
}
