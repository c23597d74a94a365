//! 服务注册表：由配置一次性构建，会话工厂从这里取得依赖
use crate::addr::TargetAddr;
use crate::channel::SharedChannel;
use crate::config::{ChainProxyConfig, ProxyConfig, ServiceConfig, ServiceKind};
use crate::connector::{Connector, TcpConnector, TlsConnector};
use crate::error::{ProxyError, Result};
use crate::http::{ChainAuthenticator, HeaderFilters, HttpProxySession};
use crate::relay::Tunnel;
use crate::stats::{ServiceStatsTracker, StatsManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};

/// 单个服务的运行时上下文
pub struct ServiceContext {
    config: ServiceConfig,
    filters: HeaderFilters,
    connector: Arc<dyn Connector>,
    chain_auth: Option<Arc<ChainAuthenticator>>,
    upstream: Option<TargetAddr>,
    stats: ServiceStatsTracker,
}

impl ServiceContext {
    pub fn new(
        config: ServiceConfig,
        connector: Arc<dyn Connector>,
        stats: ServiceStatsTracker,
    ) -> Result<Self> {
        let filters = HeaderFilters::compile(&config.filters)?;
        let chain_auth = config.chain.as_ref().and_then(|chain| {
            chain.username.as_ref().map(|username| {
                Arc::new(ChainAuthenticator::new(
                    username.clone(),
                    chain.password.clone().unwrap_or_default(),
                ))
            })
        });
        let upstream = config
            .upstream
            .as_deref()
            .map(str::parse::<TargetAddr>)
            .transpose()?;
        Ok(Self {
            config,
            filters,
            connector,
            chain_auth,
            upstream,
            stats,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn kind(&self) -> ServiceKind {
        self.config.kind
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    pub fn filters(&self) -> &HeaderFilters {
        &self.filters
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn chain(&self) -> Option<&ChainProxyConfig> {
        self.config.chain.as_ref()
    }

    pub fn chain_auth(&self) -> Option<&Arc<ChainAuthenticator>> {
        self.chain_auth.as_ref()
    }

    /// tcp/udp 服务的固定上游
    pub fn upstream(&self) -> Option<&TargetAddr> {
        self.upstream.as_ref()
    }

    pub fn stats(&self) -> &ServiceStatsTracker {
        &self.stats
    }

    /// 为一个已接受的 Channel 运行对应类型的会话
    ///
    /// udp 服务由数据报中继驱动，不经过这里。
    pub async fn serve(self: Arc<Self>, client: SharedChannel) -> Result<()> {
        let id = uuid::Uuid::new_v4();
        let peer = crate::channel::display_addr(client.peer_addr());
        let span = tracing::info_span!("session", %id, %peer, service = %self.id(), kind = %self.kind());

        async move {
            let _active = self.stats.session();
            info!("session started");
            let result = match self.kind() {
                ServiceKind::Http => HttpProxySession::new(self.clone(), client).run().await,
                ServiceKind::Socks => crate::socks::run_session(self.clone(), client).await,
                ServiceKind::Tcp => run_raw_tunnel(&self, client).await,
                ServiceKind::Udp => {
                    client.close();
                    Err(ProxyError::invalid_state("udp services have no stream sessions"))
                }
            };
            match &result {
                Ok(()) => info!("session finished"),
                Err(e) => info!(error = %e, "session ended with error"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// 原始 TCP：连接固定上游后直接进入隧道
async fn run_raw_tunnel(ctx: &Arc<ServiceContext>, client: SharedChannel) -> Result<()> {
    let Some(target) = ctx.upstream().cloned() else {
        client.close();
        return Err(ProxyError::invalid_state("tcp service without upstream"));
    };
    let upstream = match ctx.connector().connect(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            ctx.stats().record_error();
            client.close();
            return Err(e);
        }
    };
    let stats = Tunnel::bind_with_stats(client, upstream, Some(ctx.stats().clone()))
        .wait()
        .await;
    info!(
        up = stats.a_to_b,
        down = stats.b_to_a,
        "tunnel to {} finished",
        target
    );
    Ok(())
}

/// 所有服务的上下文
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceContext>>,
    stats: StatsManager,
}

impl ServiceRegistry {
    /// 使用默认连接器（直连 TCP，按需叠加 TLS）
    pub fn from_config(config: &ProxyConfig) -> anyhow::Result<Self> {
        Self::build(config, |service| {
            let tcp: Arc<dyn Connector> = Arc::new(TcpConnector::new(service.connect_timeout()));
            if !service.upstream_tls {
                return Ok(tcp);
            }
            let tls_config = crate::tls::load_client_config(
                service.upstream_ca_path.as_deref(),
                service.upstream_skip_verify,
            )?;
            Ok(Arc::new(TlsConnector::new(
                tcp,
                tls_config,
                service.upstream_sni.clone(),
                service.connect_timeout(),
            )))
        })
    }

    /// 所有服务共用注入的连接器（测试用）
    pub fn with_connector(
        config: &ProxyConfig,
        connector: Arc<dyn Connector>,
    ) -> anyhow::Result<Self> {
        Self::build(config, |_| Ok(connector.clone()))
    }

    fn build<F>(config: &ProxyConfig, mut connector_for: F) -> anyhow::Result<Self>
    where
        F: FnMut(&ServiceConfig) -> anyhow::Result<Arc<dyn Connector>>,
    {
        let stats = StatsManager::new();
        let mut services = HashMap::new();
        for service in &config.services {
            let connector = connector_for(service)?;
            let tracker = stats.register_service(&service.id);
            let context = ServiceContext::new(service.clone(), connector, tracker)
                .map_err(|e| anyhow::anyhow!("Service '{}': {}", service.id, e))?;
            services.insert(service.id.clone(), Arc::new(context));
        }
        Ok(Self { services, stats })
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceContext>> {
        self.services.get(id).cloned()
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[services]]
id = "web"
kind = "http"
  [services.chain]
  host = "proxy.local"
  port = 3128
  username = "alice"
  password = "secret"

[[services]]
id = "raw"
kind = "tcp"
upstream = "example.com:443"

[[servers]]
bind_addr = "127.0.0.1"
bind_port = 8080
service = "web"
"#;

    #[test]
    fn test_registry_builds_contexts() {
        let config = ProxyConfig::from_toml_str(CONFIG).unwrap();
        let registry = ServiceRegistry::from_config(&config).unwrap();

        let web = registry.get("web").unwrap();
        assert_eq!(web.kind(), ServiceKind::Http);
        assert!(web.chain_auth().is_some());
        assert_eq!(web.chain().unwrap().port, 3128);

        let raw = registry.get("raw").unwrap();
        assert_eq!(
            raw.upstream(),
            Some(&TargetAddr::Domain("example.com".to_string(), 443))
        );
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.stats().get_all_stats().len(), 2);
    }
}
