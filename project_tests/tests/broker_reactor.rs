//! Broker-through-reactor scenarios: a live TCP connection whose accept,
//! reads, writes and timeouts are all dispatched by the reactor, plus a
//! client session whose connect watcher and session run the same way.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use wharf::dispatch::{Dispatch, Waker};
use wharf::node::{Client, Events, Op, Server};
use wharf::scheme::{Scheme, Timeouts};

/// Boots a server on a dedicated reactor thread and returns its address
/// plus the reactor's waker.
fn reactor_server(
    scheme: Scheme,
    wire: impl FnOnce(&Server) -> Events + Send + 'static,
) -> (std::net::SocketAddr, Waker) {
    let (ready_tx, ready_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let dispatch = Dispatch::new();
        let server = Server::new(&dispatch, scheme);
        server.events(wire(&server));
        let bound = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        ready_tx.send((bound, dispatch.waker())).unwrap();
        dispatch.start().unwrap();
    });
    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("reactor thread failed to boot")
}

#[test]
fn reads_and_writes_flow_through_the_reactor() {
    // The echo happens entirely inside reactor callbacks: the read
    // readiness dispatch hands the bytes up, and the send drains under the
    // same reactor's write handling.
    let (addr, waker) = reactor_server(Scheme::new(1), |server| {
        let echo = server.clone();
        Events {
            on_read: Some(Box::new(move |id, data| {
                echo.send(id, data.to_vec()).unwrap();
            })),
            ..Default::default()
        }
    });

    let mut peer = TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    for round in 0u8..3 {
        let payload = [round; 32];
        peer.write_all(&payload).unwrap();
        let mut echoed = [0u8; 32];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload);
    }
    waker.stop();
}

#[test]
fn idle_connections_expire_through_reactor_timers() {
    let scheme = Scheme {
        timeouts: Timeouts {
            read_s: 1,
            write_s: 1,
            connect_s: 1,
        },
        ..Scheme::new(2)
    };
    let (timeout_tx, timeout_rx) = mpsc::channel();
    let (addr, waker) = reactor_server(scheme, move |_server| Events {
        on_timeout: Some(Box::new(move |id, op| {
            timeout_tx.send((id, op)).unwrap();
        })),
        ..Default::default()
    });

    // Connect and stay silent: the broker's read deadline is a reactor
    // timer and fires without any socket traffic.
    let mut peer = TcpStream::connect(addr).unwrap();
    let (_, op) = timeout_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(op, Op::Read);

    // The expired broker was closed: the peer reads EOF.
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut probe = [0u8; 4];
    assert!(matches!(peer.read(&mut probe), Ok(0) | Err(_)));
    waker.stop();
}

#[test]
fn no_callbacks_after_close_while_the_reactor_keeps_running() {
    let (seen_tx, seen_rx) = mpsc::channel();
    let (addr, waker) = reactor_server(Scheme::new(3), |server| {
        let closer = server.clone();
        Events {
            on_read: Some(Box::new(move |id, data| {
                seen_tx.send(data.to_vec()).unwrap();
                closer.close(id);
            })),
            ..Default::default()
        }
    });

    let mut peer = TcpStream::connect(addr).unwrap();
    peer.write_all(b"once").unwrap();
    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"once"
    );
    let _ = peer.write_all(b"never seen");
    assert!(seen_rx.recv_timeout(Duration::from_millis(300)).is_err());
    waker.stop();
}

#[test]
fn client_sessions_connect_and_talk_through_the_reactor() {
    // Plain std echo peer for the reactor-driven client.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
    });

    let (echo_tx, echo_rx) = mpsc::channel();
    std::thread::spawn(move || {
        let dispatch = Dispatch::new();
        let client = Client::new(&dispatch, Scheme::new(4));
        let sender = client.clone();
        let waker = dispatch.waker();
        client.events(Events {
            on_connect: Some(Box::new(move |id| {
                sender.send(id, b"hello".to_vec()).unwrap();
            })),
            on_read: Some(Box::new(move |_, data| {
                echo_tx.send(data.to_vec()).unwrap();
                waker.stop();
            })),
            ..Default::default()
        });
        let url = url::Url::parse(&format!("tcp://{addr}")).unwrap();
        client.connect(&url).unwrap();
        dispatch.start().unwrap();
    });

    assert_eq!(
        echo_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"hello"
    );
}
