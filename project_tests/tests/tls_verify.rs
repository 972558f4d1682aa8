//! TLS scenarios: SNI/SAN verification against fixture certificates, with
//! handshakes driven the way the reactor drives them — non-blocking
//! endpoints stepped on readiness.

use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use project_tests::{fixture, init_tracing};
use wharf::engine::{Endpoint, Engine, Handshake, TlsConfig, Verify};
use wharf::errors::ErrorKind;

fn client_engine() -> Engine {
    Engine::new(TlsConfig {
        ca_file: Some(fixture("ca.pem")),
        verify: Verify::Peer,
        ..Default::default()
    })
    .unwrap()
}

fn server_engine(cert: &str, key: &str) -> Engine {
    Engine::new(TlsConfig {
        cert_chain: Some(fixture(cert)),
        private_key: Some(fixture(key)),
        verify: Verify::None,
        ..Default::default()
    })
    .unwrap()
}

/// Steps both endpoints until each handshake finishes or either side
/// fails; returns the client-side outcome.
fn drive_pair(client: &mut Endpoint, server: &mut Endpoint) -> wharf::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut client_done = false;
    let mut server_done = false;
    let mut server_failed = false;
    while !(client_done && (server_done || server_failed)) {
        assert!(Instant::now() < deadline, "handshake stalled");
        if !client_done {
            match client.handshake_step()? {
                Handshake::Done => client_done = true,
                Handshake::WantRead | Handshake::WantWrite => {}
            }
        }
        if !(server_done || server_failed) {
            match server.handshake_step() {
                Ok(Handshake::Done) => server_done = true,
                Ok(_) => {}
                // The server observing the client's rejection alert is not
                // the outcome under test.
                Err(_) => server_failed = true,
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn handshake_against(
    client: &Engine,
    cert: &'static str,
    key: &'static str,
    host: &str,
) -> wharf::Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client_sock = TcpStream::connect(addr).unwrap();
    let (server_sock, _) = listener.accept().unwrap();

    let server = server_engine(cert, key);
    let mut server_end = server.wrap_server(server_sock).unwrap();
    // The dialed name decides SNI and the hostname check, regardless of
    // the literal IP the socket went to.
    let mut client_end = client.wrap_client(client_sock, host)?;
    drive_pair(&mut client_end, &mut server_end)
}

#[test]
fn matching_san_completes_the_handshake() {
    let client = client_engine();
    handshake_against(&client, "good.pem", "good.key", "api.example.com").unwrap();
}

#[test]
fn mismatched_san_fails_with_a_tls_error() {
    // The server presents a certificate for other.example.com while the
    // client dialed api.example.com.
    let client = client_engine();
    let err = handshake_against(&client, "other.pem", "other.key", "api.example.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
}

#[test]
fn a_san_free_certificate_falls_back_to_its_cn() {
    // cnonly.pem names api.example.com only in its subject CN and carries
    // no SAN at all: the fallback accepts it on the primary TLS transport.
    let client = client_engine();
    handshake_against(&client, "cnonly.pem", "cnonly.key", "api.example.com").unwrap();
}

#[test]
fn the_cn_fallback_still_requires_a_matching_name() {
    let client = client_engine();
    let err =
        handshake_against(&client, "cnonly.pem", "cnonly.key", "www.example.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
}

#[test]
fn a_certificate_with_san_gets_no_cn_fallback() {
    // other.pem has a SAN (other.example.com) and CN=other.example.com;
    // dialing a name covered by neither must fail even though the CN logic
    // exists — SAN presence disables the fallback.
    let client = client_engine();
    let err = handshake_against(&client, "other.pem", "other.key", "api.example.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
}

#[test]
fn untrusted_issuer_fails_even_with_a_matching_name() {
    // No custom CA: the fixture chain does not lead to a public root.
    let client = Engine::new(TlsConfig {
        verify: Verify::Peer,
        ..Default::default()
    })
    .unwrap();
    let err = handshake_against(&client, "good.pem", "good.key", "api.example.com").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Tls);
}

#[test]
fn wildcard_rules_match_one_label_only() {
    use wharf::engine::match_hostname;
    assert!(match_hostname("*.api.example.com", "v1.api.example.com"));
    assert!(!match_hostname("*.api.example.com", "api.example.com"));
    assert!(!match_hostname("*.api.example.com", "a.b.api.example.com"));
}
