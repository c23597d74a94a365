use crate::error::{ProxyError, Result};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// 会话的连接目标：字面地址或待解析的域名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// 由主机与端口构造；主机是 IP 字面量时直接得到 `Ip`
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain(bare.to_ascii_lowercase(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    /// 主机部分（IPv6 不带方括号）
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(host, _) => host.clone(),
        }
    }

    /// 与另一个目标是否指向同一 host:port（域名不区分大小写）
    pub fn same_endpoint(&self, other: &TargetAddr) -> bool {
        match (self, other) {
            (Self::Ip(a), Self::Ip(b)) => a == b,
            (Self::Domain(a, p), Self::Domain(b, q)) => p == q && a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl FromStr for TargetAddr {
    type Err = ProxyError;

    /// 解析 `host:port` 或 `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::invalid_argument(format!("missing port in '{}'", s)))?;
        if host.is_empty() {
            return Err(ProxyError::invalid_argument(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ProxyError::invalid_argument(format!("invalid port in '{}'", s)))?;
        Ok(Self::from_host_port(host, port))
    }
}
