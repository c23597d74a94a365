mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 服务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// HTTP 代理（含 CONNECT 与上级代理链）
    Http,
    /// SOCKS4/4a/5 代理
    Socks,
    /// 原始 TCP 转发到固定上游
    Tcp,
    /// UDP 数据报转发到固定上游
    Udp,
}

impl ServiceKind {
    /// 服务所需的监听协议
    pub fn listener_protocol(self) -> ListenerProtocol {
        match self {
            ServiceKind::Udp => ListenerProtocol::Udp,
            _ => ListenerProtocol::Tcp,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceKind::Http => "http",
            ServiceKind::Socks => "socks",
            ServiceKind::Tcp => "tcp",
            ServiceKind::Udp => "udp",
        };
        f.write_str(name)
    }
}

/// 监听协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    #[default]
    Tcp,
    Udp,
}

/// 上级代理
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// 头部过滤器作用方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    Request,
    Response,
}

/// 头部过滤动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterAction {
    /// 替换为单个值
    Set,
    /// 追加到已有值（逗号分隔），不存在则新建
    Append,
    /// 新增一个同名头部
    Add,
    /// 删除所有同名头部
    Unset,
    /// 值中不含该 token 时才追加
    Merge,
    /// 正则替换每个值中的第一处匹配
    Edit,
    /// 正则替换每个值中的所有匹配
    EditAll,
}

/// 单条头部过滤规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFilterConfig {
    pub scope: FilterScope,
    pub action: FilterAction,
    pub name: String,
    /// 头部值；edit/edit-all 时为正则表达式
    #[serde(default)]
    pub value: String,
    /// edit/edit-all 的替换文本
    #[serde(default)]
    pub replace: Option<String>,
}

/// 服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 服务 ID，被 servers 引用
    pub id: String,
    pub kind: ServiceKind,
    /// 客户端空闲超时（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 连接上游超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 固定上游 `host:port`（tcp/udp 服务）
    #[serde(default)]
    pub upstream: Option<String>,
    /// 以 TLS 连接上游（tcp 服务）
    #[serde(default)]
    pub upstream_tls: bool,
    /// 覆盖上游 TLS 的 SNI
    #[serde(default)]
    pub upstream_sni: Option<String>,
    /// 上游 TLS 使用的 CA 证书，缺省使用系统根证书
    #[serde(default)]
    pub upstream_ca_path: Option<PathBuf>,
    /// 跳过上游证书校验（仅用于测试环境）
    #[serde(default)]
    pub upstream_skip_verify: bool,
    /// 上级代理（http 服务）
    #[serde(default)]
    pub chain: Option<ChainProxyConfig>,
    /// 头部过滤规则，按顺序应用
    #[serde(default)]
    pub filters: Vec<HeaderFilterConfig>,
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    /// 使用默认超时、无上游的服务
    pub fn new(id: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            upstream: None,
            upstream_tls: false,
            upstream_sni: None,
            upstream_ca_path: None,
            upstream_skip_verify: false,
            chain: None,
            filters: Vec::new(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 客户端侧 TLS 证书选择
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCertConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// 速率限制配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
        }
    }
}

/// 监听器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    #[serde(default)]
    pub protocol: ListenerProtocol,
    /// 引用的服务 ID
    pub service: String,
    #[serde(default)]
    pub tls: Option<TlsCertConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        if self.bind_addr.contains(':') && !self.bind_addr.starts_with('[') {
            format!("[{}]:{}", self.bind_addr, self.bind_port)
        } else {
            format!("{}:{}", self.bind_addr, self.bind_port)
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl ProxyConfig {
    /// 从 TOML 文本解析并验证
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: ProxyConfig =
            toml::from_str(content).context("Failed to parse proxy configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载并验证
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_proxy_config(self)
    }

    pub fn service(&self, id: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.id == id)
    }
}
