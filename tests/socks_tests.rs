/// Integration tests for SOCKS4/4a/5 sessions
mod common;

use common::{
    get_available_port, start_echo_server, start_peer_reporting_echo_server, start_service,
    TEST_TIMEOUT,
};
use session_proxy::config::{ServiceConfig, ServiceKind};
use session_proxy::connector::TcpConnector;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn start_socks() -> SocketAddr {
    let service = ServiceConfig::new("socks", ServiceKind::Socks);
    start_service(service, Arc::new(TcpConnector::new(Duration::from_secs(2))))
        .await
        .0
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

fn v5_connect_ipv4(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("expected an IPv4 address");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    request
}

#[tokio::test]
async fn test_socks5_connect_reports_bound_address() {
    let echo = start_peer_reporting_echo_server().await;
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    client.write_all(&v5_connect_ipv4(echo)).await.unwrap();
    let reply = read_n(&mut client, 10).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    let bound = SocketAddrV4::new(
        Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]),
        u16::from_be_bytes([reply[8], reply[9]]),
    );

    // 回显服务先报告它看到的对端地址，即代理的出站地址
    let mut line = Vec::new();
    loop {
        let byte = read_n(&mut client, 1).await[0];
        if byte == b'\n' {
            break;
        }
        line.push(byte);
    }
    assert_eq!(String::from_utf8(line).unwrap(), bound.to_string());

    client.write_all(b"hello socks5").await.unwrap();
    assert_eq!(read_n(&mut client, 12).await, b"hello socks5");
}

#[tokio::test]
async fn test_socks5_domain_target() {
    let echo = start_echo_server().await;
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    let host = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&echo.port().to_be_bytes());
    // 请求后紧跟的数据也应进入隧道
    request.extend_from_slice(b"early");
    client.write_all(&request).await.unwrap();

    let reply = read_n(&mut client, 4).await;
    assert_eq!(reply[1], 0x00);
    let rest = if reply[3] == 0x01 { 6 } else { 18 };
    read_n(&mut client, rest).await;
    assert_eq!(read_n(&mut client, 5).await, b"early");
}

#[tokio::test]
async fn test_socks4a_connect_by_name() {
    let echo = start_echo_server().await;
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.extend_from_slice(b"user\0localhost\0");
    client.write_all(&request).await.unwrap();

    let reply = read_n(&mut client, 8).await;
    assert_eq!(reply[0], 0x00);
    assert_eq!(reply[1], 0x5A);

    client.write_all(b"over socks4a").await.unwrap();
    assert_eq!(read_n(&mut client, 12).await, b"over socks4a");
}

#[tokio::test]
async fn test_socks4_unreachable_rejected() {
    let port = get_available_port();
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&[127, 0, 0, 1]);
    request.push(0);
    client.write_all(&request).await.unwrap();

    let reply = read_n(&mut client, 8).await;
    assert_eq!(reply[1], 0x5B);

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_socks5_unsupported_command() {
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    // BIND
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let reply = read_n(&mut client, 10).await;
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x07);
}

#[tokio::test]
async fn test_socks5_no_acceptable_method() {
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0xFF]);

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_socks5_unreachable_reports_failure() {
    let port = get_available_port();
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    assert_eq!(read_n(&mut client, 2).await, vec![0x05, 0x00]);

    client
        .write_all(&v5_connect_ipv4(SocketAddr::from(([127, 0, 0, 1], port))))
        .await
        .unwrap();
    let reply = read_n(&mut client, 4).await;
    assert_eq!(reply[1], 0x01);
}

#[tokio::test]
async fn test_unknown_version_closes() {
    let proxy = start_socks().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x07, 0x01, 0x00]).await.unwrap();

    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}
