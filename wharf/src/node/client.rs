//! Client core: resolve, start a non-blocking connect, and let the reactor
//! drive connect readiness, the TLS handshake and the session.
//!
//! `connect` allocates the broker id up front and returns it immediately.
//! Literal addresses register at once; hostnames resolve asynchronously on
//! the reactor (through the explicit-nameserver resolver when one is
//! installed) and the connect continues from a reactor event, so nothing
//! ever blocks the loop. Establishment is announced through `on_connect`,
//! failures through `on_error`, and a connect deadline expires through
//! `on_timeout`.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::dispatch::Dispatch;
use crate::engine::{socket, Engine};
use crate::errors::{Error, Result};
use crate::node::{Core, Events};
use crate::scheme::{BrokerId, Registry, Scheme};

#[cfg(feature = "dns")]
use crate::dns::{Family, Resolver};

/// Connecting core for one scheme. Clones address the same reactor-local
/// state; everything runs on the owning reactor's thread.
#[derive(Clone)]
pub struct Client {
    core: Core,
    #[cfg(feature = "dns")]
    resolver: Rc<RefCell<Option<Arc<Resolver>>>>,
}

impl Client {
    pub fn new(dispatch: &Dispatch, scheme: Scheme) -> Self {
        Self {
            core: Core::new(dispatch, scheme),
            #[cfg(feature = "dns")]
            resolver: Rc::new(RefCell::new(None)),
        }
    }

    /// Installs the callback set.
    pub fn events(&self, events: Events) {
        self.core.set_events(events);
    }

    /// Enables TLS for `https`/`wss`/`tls` URLs.
    pub fn tls(&self, engine: Arc<Engine>) {
        self.core.set_engine(engine);
    }

    /// Resolves hosts through the explicit-nameserver resolver instead of
    /// the system one.
    #[cfg(feature = "dns")]
    pub fn resolver(&self, resolver: Arc<Resolver>) {
        *self.resolver.borrow_mut() = Some(resolver);
    }

    pub fn registry(&self) -> Rc<RefCell<Registry>> {
        self.core.registry()
    }

    /// Queues bytes to one broker.
    pub fn send(&self, id: BrokerId, data: Vec<u8>) -> Result<()> {
        self.core.send(id, data)
    }

    /// Closes one broker.
    pub fn close(&self, id: BrokerId) {
        self.core.close(id);
    }

    /// Keeps a broker alive across the current timeout callback.
    pub fn rearm(&self, id: BrokerId) {
        self.core.rearm(id);
    }

    /// Re-derives a broker's marks from link bandwidth (bits per second).
    pub fn bandwidth(&self, id: BrokerId, read_bps: u64, write_bps: u64) {
        self.core.bandwidth(id, read_bps, write_bps);
    }

    /// Starts a session towards `url` and returns its broker id. The
    /// connection itself completes on the reactor.
    pub fn connect(&self, url: &Url) -> Result<BrokerId> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::protocol(format!("url without host: {url}")))?
            .to_string();
        let wants_tls = matches!(url.scheme(), "https" | "wss" | "tls");
        let port = url
            .port_or_known_default()
            .unwrap_or(if wants_tls { 443 } else { 80 });
        let id = self.core.next_id();

        if let Ok(ip) = host.parse::<IpAddr>() {
            self.start_connect(id, SocketAddr::new(ip, port), wants_tls, &host)?;
            return Ok(id);
        }

        // Hostnames resolve asynchronously; the result arrives as a reactor
        // event and the connect continues from there.
        let this = self.clone();
        self.core.dispatch().defer(Box::new(move || {
            let resolve_and_connect = async move {
                match this.resolve(&host, port).await {
                    Ok(addr) => {
                        if let Err(err) = this.start_connect(id, addr, wants_tls, &host) {
                            this.report(id, err);
                        }
                    }
                    Err(err) => this.report(id, err),
                }
            };
            tokio::task::spawn_local(resolve_and_connect);
        }));
        debug!(%url, id, "client session pending resolution");
        Ok(id)
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        #[cfg(feature = "dns")]
        {
            let resolver = self.resolver.borrow().clone();
            if let Some(resolver) = resolver {
                let ip = resolver.resolve(host, Family::V4).await?;
                return Ok(SocketAddr::new(ip, port));
            }
        }
        let mut addresses = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::transport(format!("resolution of {host} failed: {e}")))?;
        addresses
            .next()
            .ok_or_else(|| Error::transport(format!("{host} resolved to nothing")))
    }

    fn report(&self, id: BrokerId, err: Error) {
        self.core.report_error(id, &err);
    }

    #[cfg(unix)]
    fn start_connect(
        &self,
        id: BrokerId,
        addr: SocketAddr,
        wants_tls: bool,
        host: &str,
    ) -> Result<()> {
        use std::os::fd::{AsRawFd, FromRawFd};

        let fd = socket::stream_connect_fd(&addr, 0)?;
        // SAFETY: the fd was just created by stream_connect_fd and is owned
        // here exclusively.
        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        let _ = socket::set_keep_alive(stream.as_raw_fd(), self.core.scheme().keep_alive);
        let endpoint = if wants_tls {
            let engine = self
                .core
                .engine()
                .ok_or_else(|| Error::tls(format!("{host} needs a TLS engine")))?;
            engine.wrap_client(stream, host)?
        } else {
            Engine::wrap(stream)?
        };
        self.core.register(id, endpoint, true)?;
        debug!(%addr, id, "client connect started");
        Ok(())
    }

    #[cfg(not(unix))]
    fn start_connect(
        &self,
        _id: BrokerId,
        _addr: SocketAddr,
        _wants_tls: bool,
        _host: &str,
    ) -> Result<()> {
        Err(Error::os_broken("client core requires unix descriptors"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::node::Op;

    #[test]
    fn connects_sends_and_receives_through_the_reactor() {
        // Plain std echo peer.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let (read_tx, read_rx) = mpsc::channel();
        let reactor = std::thread::spawn(move || {
            let dispatch = Dispatch::new();
            let client = Client::new(&dispatch, Scheme::new(2));
            let sender = client.clone();
            let waker = dispatch.waker();
            client.events(Events {
                on_connect: Some(Box::new(move |id| {
                    sender.send(id, b"ping".to_vec()).unwrap();
                })),
                on_read: Some(Box::new(move |_, data| {
                    read_tx.send(data.to_vec()).unwrap();
                    waker.stop();
                })),
                ..Default::default()
            });
            let url = Url::parse(&format!("tcp://{addr}")).unwrap();
            client.connect(&url).unwrap();
            dispatch.start().unwrap();
        });

        let echoed = read_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(echoed, b"ping");
        reactor.join().unwrap();
    }

    #[test]
    fn refused_connections_surface_transport_errors() {
        let (err_tx, err_rx) = mpsc::channel();
        let reactor = std::thread::spawn(move || {
            let dispatch = Dispatch::new();
            let client = Client::new(&dispatch, Scheme::new(3));
            let waker = dispatch.waker();
            client.events(Events {
                on_error: Some(Box::new(move |_, err| {
                    err_tx.send(err.kind()).unwrap();
                    waker.stop();
                })),
                ..Default::default()
            });
            // A port nothing listens on.
            let url = Url::parse("tcp://127.0.0.1:1").unwrap();
            client.connect(&url).unwrap();
            dispatch.start().unwrap();
        });

        let kind = err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(kind, crate::errors::ErrorKind::Transport);
        reactor.join().unwrap();
    }

    #[test]
    fn connect_timeouts_fire_through_the_reactor() {
        let scheme = Scheme {
            timeouts: crate::scheme::Timeouts {
                read_s: 0,
                write_s: 0,
                connect_s: 1,
            },
            ..Scheme::new(4)
        };
        let (timeout_tx, timeout_rx) = mpsc::channel();
        let reactor = std::thread::spawn(move || {
            let dispatch = Dispatch::new();
            let client = Client::new(&dispatch, scheme);
            let waker = dispatch.waker();
            let on_timeout_tx = timeout_tx.clone();
            client.events(Events {
                on_timeout: Some(Box::new(move |_, op| {
                    on_timeout_tx.send(op).unwrap();
                    waker.stop();
                })),
                ..Default::default()
            });
            // A blackholed TEST-NET address: connect never completes. On
            // hosts without a route the attempt fails on the spot, which
            // counts as the connect never establishing either.
            let url = Url::parse("tcp://203.0.113.1:81").unwrap();
            match client.connect(&url) {
                Ok(_) => dispatch.start().unwrap(),
                Err(_) => timeout_tx.send(Op::Connect).unwrap(),
            }
        });

        let op = timeout_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(op, Op::Connect);
        reactor.join().unwrap();
    }
}
