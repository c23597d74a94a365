use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{ListenerProtocol, ProxyConfig};

/// 检查配置文件权限（仅Unix系统）
///
/// 配置中可能包含上级代理的用户名和密码。
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    if mode & 0o004 != 0 {
        warn!(
            "SECURITY WARNING: Config file '{}' is readable by others (permissions: {:o}). \
             It may contain chained proxy credentials. RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    if mode & 0o040 != 0 {
        warn!(
            "SECURITY WARNING: Config file '{}' is readable by group (permissions: {:o}). \
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置中引用但不存在的文件
fn missing_files(config: &ProxyConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    for server in &config.servers {
        if let Some(tls) = &server.tls {
            for (what, path) in [("Certificate", &tls.cert_path), ("Key", &tls.key_path)] {
                if !path.exists() {
                    warnings.push(format!(
                        "{} file not found for {}: {:?}",
                        what,
                        server.bind_address(),
                        path
                    ));
                }
            }
        }
    }
    for service in &config.services {
        if let Some(ca) = &service.upstream_ca_path {
            if !ca.exists() {
                warnings.push(format!(
                    "CA certificate file not found for service '{}': {:?}",
                    service.id, ca
                ));
            }
        }
        if service.upstream_skip_verify {
            warnings.push(format!(
                "Service '{}' skips upstream certificate verification",
                service.id
            ));
        }
    }
    warnings
}

fn details(config: &ProxyConfig) -> serde_json::Value {
    let services: Vec<_> = config
        .services
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "kind": s.kind,
                "upstream": s.upstream,
                "upstream_tls": s.upstream_tls,
                "chain": s.chain.as_ref().map(|c| format!("{}:{}", c.host, c.port)),
                "chain_auth": s.chain.as_ref().map(|c| c.username.is_some()).unwrap_or(false),
                "filters": s.filters.len(),
                "idle_timeout_secs": s.idle_timeout_secs,
            })
        })
        .collect();
    let servers: Vec<_> = config
        .servers
        .iter()
        .map(|s| {
            serde_json::json!({
                "bind": s.bind_address(),
                "protocol": s.protocol,
                "service": s.service,
                "tls": s.tls.is_some(),
                "rate_limit": s.rate_limit,
            })
        })
        .collect();
    serde_json::json!({ "services": services, "servers": servers })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    match ProxyConfig::load(path) {
        Ok(config) => {
            let warnings = missing_files(&config);
            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: details(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
                return Ok(());
            }

            println!("✓ Services: {}", config.services.len());
            for service in &config.services {
                print!("  '{}' ({})", service.id, service.kind);
                if let Some(upstream) = &service.upstream {
                    print!(" -> {}", upstream);
                    if service.upstream_tls {
                        print!(" over TLS");
                    }
                }
                if let Some(chain) = &service.chain {
                    print!(" via {}:{}", chain.host, chain.port);
                }
                if !service.filters.is_empty() {
                    print!(", {} header filter(s)", service.filters.len());
                }
                println!();
            }
            println!("✓ Servers: {}", config.servers.len());
            for server in &config.servers {
                let protocol = match server.protocol {
                    ListenerProtocol::Tcp => "tcp",
                    ListenerProtocol::Udp => "udp",
                };
                println!(
                    "  {}/{} -> '{}'{}",
                    server.bind_address(),
                    protocol,
                    server.service,
                    if server.tls.is_some() { " (TLS)" } else { "" }
                );
            }
            for warning in &warnings {
                println!("⚠ Warning: {}", warning);
            }
            println!("\n✓ Configuration is valid!");
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Every [[servers]] entry must reference an existing service id");
                println!("  3. tcp and udp services need 'upstream = \"host:port\"'");
                println!("  4. udp services need 'protocol = \"udp\"' on their servers");
                println!("  5. edit / edit-all filters need a valid regex and 'replace'");
            }

            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/etc/proxy.toml").unwrap(), "/etc/proxy.toml");
        assert!(Path::new(&expand_path("proxy.toml").unwrap()).is_absolute());
    }

    #[test]
    fn test_check_config_missing_file() {
        assert!(check_config("/nonexistent/session-proxy.toml", "json").is_err());
    }

    #[test]
    fn test_missing_files_reported() {
        let config = ProxyConfig::from_toml_str(
            r#"
[[services]]
id = "db"
kind = "tcp"
upstream = "127.0.0.1:5432"
upstream_tls = true
upstream_ca_path = "/nonexistent/ca.pem"

[[servers]]
bind_addr = "127.0.0.1"
bind_port = 15432
service = "db"
"#,
        )
        .unwrap();
        let warnings = missing_files(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("CA certificate"));
    }
}
