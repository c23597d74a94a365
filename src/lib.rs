/// Session Proxy 库入口
///
/// 会话引擎（Channel、TLS 会话、隧道中继、HTTP/SOCKS/数据报会话）以及
/// 让二进制可以运行的配置、注册表与监听器
pub mod addr;
pub mod channel;
pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod http;
pub mod rate_limiter;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socks;
pub mod stats;
pub mod tls;

// 重新导出常用类型
pub use addr::TargetAddr;
pub use channel::{Channel, ChannelReader, SharedChannel, TcpChannel, TlsSession, UdpChannel};
pub use config::{ProxyConfig, ServerConfig, ServiceConfig, ServiceKind};
pub use connector::{Connector, TcpConnector, TlsConnector};
pub use error::{ProxyError, Result};
pub use rate_limiter::RateLimiter;
pub use registry::{ServiceContext, ServiceRegistry};
pub use relay::{Tunnel, TunnelStats};
pub use stats::{ServiceStats, StatsManager};
