use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "session-proxy")]
#[command(author, version, about = "Intercepting HTTP/SOCKS/TCP/UDP proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，可被 RUST_LOG 覆盖
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 按配置启动所有监听器
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,
    },
    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "proxy.toml")]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 输出配置模板
    Template {
        /// 输出文件路径，缺省打印到标准输出
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 额外的 SAN（逗号分隔）
        #[arg(long, value_delimiter = ',')]
        alt_names: Vec<String>,
    },
}
