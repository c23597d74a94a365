/// Integration tests for tcp/udp listeners, TLS on either side and rate limiting
mod common;

use common::{
    generate_test_certs, server_config, start_echo_server, start_service_with, TestCleanup,
    TEST_TIMEOUT,
};
use session_proxy::config::{
    ListenerProtocol, ProxyConfig, RateLimitConfig, ServiceConfig, ServiceKind,
};
use session_proxy::connector::TcpConnector;
use session_proxy::registry::ServiceRegistry;
use session_proxy::server::{TcpServer, UdpServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn tcp_service(upstream: SocketAddr) -> ServiceConfig {
    let mut service = ServiceConfig::new("db", ServiceKind::Tcp);
    service.upstream = Some(upstream.to_string());
    service
}

fn connector() -> Arc<TcpConnector> {
    Arc::new(TcpConnector::new(Duration::from_secs(2)))
}

async fn echo_round_trip<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_raw_tcp_tunnel() {
    let echo = start_echo_server().await;
    let (proxy, ctx) = start_service_with(
        server_config("db", None),
        tcp_service(echo),
        connector(),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    echo_round_trip(&mut client, b"raw tunnel").await;
    drop(client);

    // 隧道结束后会话计数归零
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = ctx.stats().get_stats();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.bytes_upstream, 10);
    assert_eq!(stats.bytes_downstream, 10);
}

#[tokio::test]
async fn test_tls_listener() {
    let (cert_path, key_path) = generate_test_certs();
    let _cleanup = TestCleanup::new(cert_path.clone(), key_path.clone());

    let echo = start_echo_server().await;
    let (proxy, _) = start_service_with(
        server_config("db", Some((cert_path.clone(), key_path.clone()))),
        tcp_service(echo),
        connector(),
    )
    .await;

    let tls_config = session_proxy::tls::load_client_config(Some(&cert_path), true)
        .expect("Failed to load client config");
    let tcp = TcpStream::connect(proxy).await.unwrap();
    let name = session_proxy::tls::server_name("localhost").unwrap();
    let mut client = timeout(TEST_TIMEOUT, TlsConnector::from(tls_config).connect(name, tcp))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");

    echo_round_trip(&mut client, b"through tls").await;
    echo_round_trip(&mut client, &vec![0x5a; 64 * 1024]).await;
}

#[tokio::test]
async fn test_failed_tls_handshake_is_counted() {
    let (cert_path, key_path) = generate_test_certs();
    let _cleanup = TestCleanup::new(cert_path.clone(), key_path.clone());

    let echo = start_echo_server().await;
    let (proxy, ctx) = start_service_with(
        server_config("db", Some((cert_path, key_path))),
        tcp_service(echo),
        connector(),
    )
    .await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: not-tls\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    let _ = timeout(TEST_TIMEOUT, client.read_to_end(&mut rest)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.stats().get_stats().errors, 1);
    assert_eq!(ctx.stats().get_stats().total_sessions, 0);
}

#[tokio::test]
async fn test_silent_tls_client_times_out() {
    let (cert_path, key_path) = generate_test_certs();
    let _cleanup = TestCleanup::new(cert_path.clone(), key_path.clone());

    let echo = start_echo_server().await;
    let mut service = tcp_service(echo);
    service.idle_timeout_secs = 1;
    let (proxy, ctx) = start_service_with(
        server_config("db", Some((cert_path, key_path))),
        service,
        connector(),
    )
    .await;

    // 连上后不发送 ClientHello，监听器应在空闲超时后主动断开
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("silent client was never disconnected")
        .ok();
    assert!(rest.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.stats().get_stats().errors, 1);
    assert_eq!(ctx.stats().get_stats().total_sessions, 0);
}

#[tokio::test]
async fn test_upstream_tls() {
    let (cert_path, key_path) = generate_test_certs();
    let _cleanup = TestCleanup::new(cert_path.clone(), key_path.clone());

    let acceptor = TlsAcceptor::from(
        session_proxy::tls::load_server_config(&cert_path, &key_path).unwrap(),
    );
    let tls_echo = common::spawn_server(move |socket| {
        let acceptor = acceptor.clone();
        async move {
            let Ok(mut stream) = acceptor.accept(socket).await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    })
    .await;

    let mut service = tcp_service(tls_echo);
    service.upstream_tls = true;
    service.upstream_sni = Some("localhost".to_string());
    service.upstream_ca_path = Some(cert_path.clone());
    service.upstream_skip_verify = true;
    let server = server_config("db", None);
    let config = ProxyConfig {
        services: vec![service],
        servers: vec![server.clone()],
    };
    let registry = ServiceRegistry::from_config(&config).unwrap();
    let listener = TcpServer::bind(&server, registry.get("db").unwrap())
        .await
        .unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let mut client = TcpStream::connect(proxy).await.unwrap();
    echo_round_trip(&mut client, b"wrapped upstream").await;
}

#[tokio::test]
async fn test_rate_limited_listener() {
    let echo = start_echo_server().await;
    let mut server = server_config("db", None);
    server.rate_limit = Some(RateLimitConfig {
        requests_per_second: 1,
        burst_size: 1,
    });
    let (proxy, _) = start_service_with(server, tcp_service(echo), connector()).await;

    let mut first = TcpStream::connect(proxy).await.unwrap();
    echo_round_trip(&mut first, b"allowed").await;

    // 第二个连接超出配额，被直接关闭
    let mut second = TcpStream::connect(proxy).await.unwrap();
    let _ = second.write_all(b"dropped").await;
    let mut rest = Vec::new();
    let _ = timeout(TEST_TIMEOUT, second.read_to_end(&mut rest)).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_udp_listener_relays_datagrams() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = upstream.recv_from(&mut buf).await {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = upstream.send_to(&reply, from).await;
        }
    });

    let mut service = ServiceConfig::new("dns", ServiceKind::Udp);
    service.upstream = Some(upstream_addr.to_string());
    let mut server = server_config("dns", None);
    server.protocol = ListenerProtocol::Udp;
    let config = ProxyConfig {
        services: vec![service],
        servers: vec![server.clone()],
    };
    let registry = ServiceRegistry::from_config(&config).unwrap();
    let ctx = registry.get("dns").unwrap();
    let listener = UdpServer::bind(&server, ctx.clone()).await.unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(listener.run());

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for query in [&b"first"[..], &b"second"[..]] {
        client.send_to(query, proxy).await.unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        assert_eq!(from, proxy);
        assert_eq!(&buf[..3], b"re:");
        assert_eq!(&buf[3..n], query);
    }
    assert_eq!(ctx.stats().get_stats().total_sessions, 2);
}
