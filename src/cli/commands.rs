use anyhow::Result;
use tracing::info;

use crate::{config::ProxyConfig, server};

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// Run all configured listeners
async fn run_proxy(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading proxy configuration from: {}", config_path);
    let proxy_config = ProxyConfig::load(&config_path)?;
    info!(
        "{} service(s), {} server(s) configured",
        proxy_config.services.len(),
        proxy_config.servers.len()
    );

    server::run(proxy_config).await
}
