//! SOCKS5 scenario: authenticated CONNECT through a live proxy, then a
//! byte-for-byte transparent tunnel.

use project_tests::init_tracing;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wharf::socks5::{client, server, Destination};

#[tokio::test]
async fn credentialed_connect_tunnels_bytes_verbatim() {
    init_tracing();

    // Echo target the proxy will connect to.
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    });

    // The proxy itself.
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut inbound, _) = proxy.accept().await.unwrap();
        let validator: server::Validator = Box::new(|u, p| u == "u" && p == "p");
        let (mut outbound, _dest) = server::serve(&mut inbound, Some(validator))
            .await
            .unwrap();
        server::tunnel(&mut inbound, &mut outbound).await.unwrap();
    });

    // Client side: handshake with credentials, then application bytes.
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let destination = Destination::Ipv4(
        match target_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        },
        target_addr.port(),
    );
    let leftover = client::connect(
        &mut stream,
        destination,
        Some(("u".to_string(), "p".to_string())),
    )
    .await
    .unwrap();
    assert!(leftover.is_empty());

    stream.write_all(b"magic").await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    // The target saw exactly our five bytes and echoed them unchanged.
    assert_eq!(&echoed, b"magic");
}

#[tokio::test]
async fn wrong_credentials_are_refused() {
    init_tracing();
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut inbound, _) = proxy.accept().await.unwrap();
        let validator: server::Validator = Box::new(|_, _| false);
        let _ = server::serve(&mut inbound, Some(validator)).await;
    });

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let outcome = client::connect(
        &mut stream,
        Destination::Domain("example.com".into(), 443),
        Some(("u".to_string(), "wrong".to_string())),
    )
    .await;
    assert!(outcome.is_err());
}

#[tokio::test]
async fn domain_destinations_resolve_at_the_proxy() {
    init_tracing();
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = target.accept().await.unwrap();
        stream.write_all(b"hello from target").await.unwrap();
    });

    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut inbound, _) = proxy.accept().await.unwrap();
        let (mut outbound, dest) = server::serve(&mut inbound, None).await.unwrap();
        assert_eq!(dest, Destination::Domain("localhost".into(), target_addr.port()));
        server::tunnel(&mut inbound, &mut outbound).await.unwrap();
    });

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut collected = client::connect(
        &mut stream,
        Destination::Domain("localhost".into(), target_addr.port()),
        None,
    )
    .await
    .unwrap();
    while collected.len() < "hello from target".len() {
        let mut buf = [0u8; 64];
        let read = stream.read(&mut buf).await.unwrap();
        assert!(read > 0, "stream ended early");
        collected.extend_from_slice(&buf[..read]);
    }
    assert_eq!(collected, b"hello from target");
}
