use anyhow::{bail, Context, Result};
use regex::bytes::Regex;
use std::collections::HashSet;
use tracing::warn;

use super::{
    FilterAction, HeaderFilterConfig, ListenerProtocol, ProxyConfig, RateLimitConfig,
    ServerConfig, ServiceConfig, ServiceKind,
};
use crate::addr::TargetAddr;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }

    /// 验证头部过滤规则
    pub fn validate_filters(filters: &[HeaderFilterConfig], context: &str) -> Result<()> {
        for filter in filters {
            Self::validate_name(&filter.name, &format!("{} filter", context))?;
            if filter.name.bytes().any(|b| !is_token_byte(b)) {
                bail!("{}: invalid header name '{}'", context, filter.name);
            }
            match filter.action {
                FilterAction::Edit | FilterAction::EditAll => {
                    Regex::new(&filter.value).with_context(|| {
                        format!(
                            "{}: filter on '{}' has an invalid regex",
                            context, filter.name
                        )
                    })?;
                    if filter.replace.is_none() {
                        bail!(
                            "{}: edit filter on '{}' requires 'replace'",
                            context,
                            filter.name
                        );
                    }
                }
                FilterAction::Unset => {}
                _ => {
                    if filter.value.contains(['\r', '\n']) {
                        bail!(
                            "{}: filter value for '{}' must not contain line breaks",
                            context,
                            filter.name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// 验证单个服务
    pub fn validate_service(service: &ServiceConfig) -> Result<()> {
        let context = format!("Service '{}'", service.id);
        if service.idle_timeout_secs == 0 {
            bail!("{}: idle_timeout_secs must be greater than 0", context);
        }
        if service.connect_timeout_secs == 0 {
            bail!("{}: connect_timeout_secs must be greater than 0", context);
        }

        match service.kind {
            ServiceKind::Tcp | ServiceKind::Udp => {
                let upstream = match &service.upstream {
                    Some(upstream) => upstream,
                    None => bail!("{}: {} services require 'upstream'", context, service.kind),
                };
                let target: TargetAddr = upstream
                    .parse()
                    .map_err(|e| anyhow::anyhow!("{}: {}", context, e))?;
                Self::validate_port(target.port(), &context)?;
            }
            ServiceKind::Http | ServiceKind::Socks => {
                if service.upstream.is_some() {
                    bail!(
                        "{}: 'upstream' is only valid for tcp and udp services",
                        context
                    );
                }
            }
        }

        if service.upstream_tls && service.kind != ServiceKind::Tcp {
            bail!("{}: 'upstream_tls' is only valid for tcp services", context);
        }

        if let Some(chain) = &service.chain {
            if service.kind != ServiceKind::Http {
                bail!("{}: 'chain' is only valid for http services", context);
            }
            Self::validate_address(&chain.host, &format!("{} chain", context))?;
            Self::validate_port(chain.port, &format!("{} chain", context))?;
            if chain.password.is_some() && chain.username.is_none() {
                bail!("{}: chain password given without username", context);
            }
        }

        if !service.filters.is_empty() && service.kind != ServiceKind::Http {
            bail!("{}: 'filters' are only valid for http services", context);
        }
        Self::validate_filters(&service.filters, &context)?;
        Ok(())
    }

    /// 验证单个监听器
    pub fn validate_server(server: &ServerConfig, service: &ServiceConfig) -> Result<()> {
        let context = format!("Server {}", server.bind_address());
        Self::validate_address(&server.bind_addr, &context)?;

        let expected = service.kind.listener_protocol();
        if server.protocol != expected {
            bail!(
                "{}: service '{}' of kind {} needs a {:?} listener",
                context,
                service.id,
                service.kind,
                expected
            );
        }

        if let Some(tls) = &server.tls {
            if server.protocol == ListenerProtocol::Udp {
                bail!("{}: TLS is not supported on udp listeners", context);
            }
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                bail!("{}: tls.cert_path and tls.key_path must both be set", context);
            }
        }

        if let Some(rate_limit) = &server.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_proxy_config(config: &ProxyConfig) -> Result<()> {
        if config.servers.is_empty() {
            bail!("No servers defined");
        }

        let mut seen_ids = HashSet::new();
        for service in &config.services {
            Self::validate_name(&service.id, "Service id")?;
            if !seen_ids.insert(service.id.as_str()) {
                bail!(
                    "Duplicate service id '{}': each service must have a unique id",
                    service.id
                );
            }
            Self::validate_service(service)?;
        }

        let mut seen_binds = HashSet::new();
        for server in &config.servers {
            if !seen_binds.insert((server.bind_addr.clone(), server.bind_port, server.protocol)) {
                bail!(
                    "Duplicate server binding {} ({:?}): each server must use a different address/port",
                    server.bind_address(),
                    server.protocol
                );
            }
            let service = match config.service(&server.service) {
                Some(service) => service,
                None => bail!(
                    "Server {} references unknown service '{}'",
                    server.bind_address(),
                    server.service
                ),
            };
            Self::validate_server(server, service)?;
        }
        Ok(())
    }
}

/// RFC 7230 token 字符
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
