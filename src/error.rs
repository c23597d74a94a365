/// 会话引擎错误类型
///
/// 使用 thiserror 定义与会话边界对应的错误分类：
/// 协议错误和上游错误在会话边界被恢复，其余错误终止单个操作
use std::io;
use thiserror::Error;

/// 会话引擎的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 调用方传入了非法参数
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 在已关闭或尚未就绪的 Channel/会话上执行操作
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// 请求、响应或握手帧格式错误
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// 解析或连接上游失败
    #[error("Upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    /// 对端有序关闭（不是真正的错误）
    #[error("Peer closed the connection")]
    PeerClosed,

    /// 缓冲区分配失败
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// 超时
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// TLS 层错误
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建参数错误
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// 创建状态错误
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建上游不可达错误
    pub fn upstream(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnreachable {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 创建内存分配失败错误
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Channel 已关闭
    pub fn closed() -> Self {
        Self::InvalidState("channel closed".to_string())
    }

    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamUnreachable { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// 是否可以在会话边界恢复（向客户端发送错误响应或静默结束会话）
    ///
    /// 只有内部不变量被破坏时才不可恢复
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_))
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        let kind = match &err {
            ProxyError::PeerClosed => io::ErrorKind::UnexpectedEof,
            ProxyError::Timeout { .. } => io::ErrorKind::TimedOut,
            ProxyError::InvalidState(_) => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        match err {
            ProxyError::Io(e) => e,
            other => io::Error::new(kind, other.to_string()),
        }
    }
}
