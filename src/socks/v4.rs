//! SOCKS4 / SOCKS4a 报文
use crate::addr::TargetAddr;
use crate::channel::ChannelReader;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const VERSION: u8 = 0x04;
pub const CMD_CONNECT: u8 = 0x01;
pub const REPLY_GRANTED: u8 = 0x5A;
pub const REPLY_REJECTED: u8 = 0x5B;

/// USERID 与 4a 域名字段的最大长度
const MAX_FIELD: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub target: TargetAddr,
    pub user_id: Bytes,
}

/// 读取版本字节之后的请求部分
///
/// `0.0.0.x`（x ≠ 0）表示 4a 扩展：USERID 之后跟随以 NUL 结尾的域名。
pub async fn read_request(reader: &mut ChannelReader) -> Result<Request> {
    let command = reader.read_u8().await?;
    let port = reader.read_u16().await?;
    let ip = reader.read_exact(4).await?;
    let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
    let user_id = reader.read_until_nul(MAX_FIELD).await?;

    let octets = ip.octets();
    let target = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let domain = reader.read_until_nul(MAX_FIELD).await?;
        let domain = std::str::from_utf8(&domain)
            .map_err(|_| ProxyError::protocol("SOCKS4a domain is not valid utf-8"))?;
        if domain.is_empty() {
            return Err(ProxyError::protocol("empty SOCKS4a domain"));
        }
        TargetAddr::from_host_port(domain, port)
    } else {
        TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    };

    Ok(Request {
        command,
        target,
        user_id,
    })
}

/// 8 字节应答；`bound` 为 IPv4 时回显，否则填零
pub fn reply(code: u8, bound: Option<SocketAddr>) -> [u8; 8] {
    let (ip, port) = match bound {
        Some(SocketAddr::V4(addr)) => (addr.ip().octets(), addr.port()),
        _ => ([0; 4], 0),
    };
    let port = port.to_be_bytes();
    [0x00, code, port[0], port[1], ip[0], ip[1], ip[2], ip[3]]
}
