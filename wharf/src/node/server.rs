//! Server core: a reactor-registered listener that turns accepted sockets
//! into brokers.

use std::cell::RefCell;
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::{Dispatch, Kind};
use crate::engine::{socket, Engine};
use crate::errors::Result;
use crate::node::{Core, Events};
use crate::scheme::{BrokerId, Registry, Scheme};

/// Accepting core for one scheme. Clones address the same reactor-local
/// state; everything runs on the owning reactor's thread.
#[derive(Clone)]
pub struct Server {
    core: Core,
    listeners: Rc<RefCell<Vec<TcpListener>>>,
    backlog: Rc<RefCell<i32>>,
    ipv6_only: Rc<RefCell<Option<bool>>>,
}

impl Server {
    pub fn new(dispatch: &Dispatch, scheme: Scheme) -> Self {
        Self {
            core: Core::new(dispatch, scheme),
            listeners: Rc::new(RefCell::new(Vec::new())),
            backlog: Rc::new(RefCell::new(1024)),
            ipv6_only: Rc::new(RefCell::new(None)),
        }
    }

    /// Installs the callback set.
    pub fn events(&self, events: Events) {
        self.core.set_events(events);
    }

    /// Serves TLS using the engine's pre-loaded chain and key.
    pub fn tls(&self, engine: Arc<Engine>) {
        self.core.set_engine(engine);
    }

    /// IPV6_V6ONLY toggle for subsequent listeners.
    pub fn ipv6_only(&self, on: bool) {
        *self.ipv6_only.borrow_mut() = Some(on);
    }

    pub fn backlog(&self, backlog: i32) {
        *self.backlog.borrow_mut() = backlog.max(1);
    }

    /// Shared registry for resolving broker ids.
    pub fn registry(&self) -> Rc<RefCell<Registry>> {
        self.core.registry()
    }

    /// Queues bytes to one broker.
    pub fn send(&self, id: BrokerId, data: Vec<u8>) -> Result<()> {
        self.core.send(id, data)
    }

    /// Closes one broker; its READ/WRITE/TIMER callbacks stop immediately.
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

    /// Binds a listener (SO_REUSEADDR, non-blocking) and registers its
    /// readiness with the reactor. Returns the bound address.
    #[cfg(unix)]
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        use std::os::fd::{AsRawFd, FromRawFd};

        let fd =
            socket::stream_listen_fd(&addr, *self.backlog.borrow(), 0, *self.ipv6_only.borrow())?;
        // SAFETY: the fd was just created by stream_listen_fd and is owned
        // here exclusively.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        let bound = listener.local_addr()?;

        let event = self.core.next_id() * 4;
        let this = self.clone();
        let index = self.listeners.borrow().len();
        self.core.dispatch().add_event(
            event,
            listener.as_raw_fd(),
            Rc::new(RefCell::new(move |_, kind| {
                if kind == Kind::Read {
                    this.accept_ready(index);
                }
            })),
        )?;
        self.core.dispatch().mode(event, Kind::Read, true)?;
        self.listeners.borrow_mut().push(listener);
        info!(scheme = self.core.scheme().id, %bound, "listener established");
        Ok(bound)
    }

    #[cfg(unix)]
    fn accept_ready(&self, index: usize) {
        loop {
            let accepted = {
                let listeners = self.listeners.borrow();
                let Some(listener) = listeners.get(index) else { return };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "inbound connection");
                    if let Err(err) = self.admit(stream) {
                        warn!(%peer, "connection refused: {err}");
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }

    #[cfg(unix)]
    fn admit(&self, stream: std::net::TcpStream) -> Result<()> {
        use std::os::fd::AsRawFd;
        let _ = socket::set_keep_alive(stream.as_raw_fd(), self.core.scheme().keep_alive);
        let endpoint = match self.core.engine() {
            Some(engine) => engine.wrap_server(stream)?,
            None => Engine::wrap(stream)?,
        };
        let id = self.core.next_id();
        self.core.register(id, endpoint, false)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::node::Op;

    /// Runs a server on its own reactor thread; yields the bound address
    /// and the reactor waker.
    fn spawn_server(
        scheme: Scheme,
        wire_events: impl FnOnce(&Server) -> Events + Send + 'static,
    ) -> (SocketAddr, crate::dispatch::Waker) {
        let (ready_tx, ready_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let dispatch = Dispatch::new();
            let server = Server::new(&dispatch, scheme);
            server.events(wire_events(&server));
            let bound = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
            ready_tx.send((bound, dispatch.waker())).unwrap();
            dispatch.start().unwrap();
        });
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server thread died")
    }

    #[test]
    fn accepts_and_reads_through_the_reactor() {
        let (read_tx, read_rx) = mpsc::channel();
        let (addr, waker) = spawn_server(Scheme::new(1), move |_server| Events {
            on_read: Some(Box::new(move |id, data| {
                read_tx.send((id, data.to_vec())).unwrap();
            })),
            ..Default::default()
        });

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"ahoy").unwrap();
        let (_, data) = read_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(data, b"ahoy");
        waker.stop();
    }

    #[test]
    fn echoes_through_send_on_the_reactor() {
        let (addr, waker) = spawn_server(Scheme::new(1), |server| {
            let echo = server.clone();
            Events {
                on_read: Some(Box::new(move |id, data| {
                    echo.send(id, data.to_vec()).unwrap();
                })),
                ..Default::default()
            }
        });

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"marco").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"marco");
        waker.stop();
    }

    #[test]
    fn closed_brokers_emit_no_further_reads() {
        let (seen_tx, seen_rx) = mpsc::channel();
        let (addr, waker) = spawn_server(Scheme::new(1), |server| {
            let closer = server.clone();
            Events {
                on_read: Some(Box::new(move |id, data| {
                    seen_tx.send(data.to_vec()).unwrap();
                    // First delivery closes the broker on the spot.
                    closer.close(id);
                })),
                ..Default::default()
            }
        });

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"first").unwrap();
        assert_eq!(
            seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"first"
        );

        // Bytes after the close never reach a callback; the peer observes
        // the connection going down instead.
        let _ = client.write_all(b"late");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut probe = [0u8; 8];
        let eof = matches!(client.read(&mut probe), Ok(0) | Err(_));
        assert!(eof);
        assert!(seen_rx
            .recv_timeout(Duration::from_millis(300))
            .is_err());
        waker.stop();
    }

    #[test]
    fn read_timeouts_surface_and_close() {
        let (timeout_tx, timeout_rx) = mpsc::channel();
        let scheme = Scheme {
            timeouts: crate::scheme::Timeouts {
                read_s: 1,
                write_s: 1,
                connect_s: 1,
            },
            ..Scheme::new(1)
        };
        let (addr, waker) = spawn_server(scheme, move |_server| Events {
            on_timeout: Some(Box::new(move |id, op| {
                timeout_tx.send((id, op)).unwrap();
            })),
            ..Default::default()
        });

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (_, op) = timeout_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(op, Op::Read);
        drop(client);
        waker.stop();
    }
}
