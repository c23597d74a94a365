//! SOCKS5 报文（RFC 1928），只支持 NO_AUTH 与 CONNECT
use crate::addr::TargetAddr;
use crate::channel::ChannelReader;
use crate::error::{ProxyError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// 解析后的命令请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(TargetAddr),
    /// 需要以给定应答码拒绝
    Reject(u8),
}

/// 读取方法列表（版本字节之后），返回客户端是否提供 NO_AUTH
pub async fn read_methods(reader: &mut ChannelReader) -> Result<bool> {
    let count = reader.read_u8().await?;
    if count == 0 {
        return Err(ProxyError::protocol("SOCKS5 greeting without methods"));
    }
    let methods = reader.read_exact(count as usize).await?;
    Ok(methods.contains(&METHOD_NO_AUTH))
}

pub fn method_reply(method: u8) -> [u8; 2] {
    [VERSION, method]
}

pub async fn read_request(reader: &mut ChannelReader) -> Result<Request> {
    let head = reader.read_exact(4).await?;
    if head[0] != VERSION {
        return Err(ProxyError::protocol(format!(
            "unexpected SOCKS5 request version {:#04x}",
            head[0]
        )));
    }
    let command = head[1];

    let target = match head[3] {
        ATYP_IPV4 => {
            let ip = reader.read_exact(4).await?;
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(
                Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]).into(),
                port,
            ))
        }
        ATYP_IPV6 => {
            let ip = reader.read_exact(16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip);
            let port = reader.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            if len == 0 {
                return Err(ProxyError::protocol("empty SOCKS5 domain"));
            }
            let domain = reader.read_exact(len).await?;
            let domain = std::str::from_utf8(&domain)
                .map_err(|_| ProxyError::protocol("SOCKS5 domain is not valid utf-8"))?
                .to_string();
            let port = reader.read_u16().await?;
            TargetAddr::from_host_port(&domain, port)
        }
        _ => return Ok(Request::Reject(REP_ADDRESS_NOT_SUPPORTED)),
    };

    if command != CMD_CONNECT {
        return Ok(Request::Reject(REP_COMMAND_NOT_SUPPORTED));
    }
    Ok(Request::Connect(target))
}

/// 命令应答，`bound` 为中继在上游侧的本地端点
pub fn reply(code: u8, bound: Option<SocketAddr>) -> Vec<u8> {
    let mut out = vec![VERSION, code, 0x00];
    match bound {
        Some(SocketAddr::V6(addr)) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V4(addr)) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&[0; 6]);
        }
    }
    out
}
