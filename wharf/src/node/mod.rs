//! Role cores: the server and client façades over engine, scheme and
//! reactor.
//!
//! The reactor is the substrate: every broker registers its descriptor and
//! its per-operation timers with the owning [`Dispatch`], and all callbacks
//! run on that reactor's thread, never in parallel. Reads coalesce under
//! the scheme's rate marks, writes drain a bounded FIFO queue under write
//! readiness, and expired deadlines surface through the typed callback set
//! before the broker closes (unless the handler re-arms). Protocol layers
//! talk to brokers by id through the registry; they never touch sockets.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::dispatch::{Dispatch, EventId, Kind};
use crate::engine::{Endpoint, Engine, Handshake, IoKind};
use crate::errors::{Error, Result};
use crate::scheme::{marks_for_bandwidth, Broker, BrokerId, Marks, Registry, Scheme};

/// Which per-operation deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Connect,
}

/// Typed callback set shared by both cores.
///
/// Callbacks run on the owning reactor's thread and must return promptly;
/// they may resolve broker ids through the registry and queue sends.
#[derive(Default)]
pub struct Events {
    pub on_connect: Option<Box<dyn Fn(BrokerId)>>,
    pub on_disconnect: Option<Box<dyn Fn(BrokerId)>>,
    pub on_read: Option<Box<dyn Fn(BrokerId, &[u8])>>,
    pub on_write: Option<Box<dyn Fn(BrokerId, usize)>>,
    pub on_timeout: Option<Box<dyn Fn(BrokerId, Op)>>,
    pub on_error: Option<Box<dyn Fn(BrokerId, &Error)>>,
}

impl Events {
    fn read(&self, id: BrokerId, data: &[u8]) {
        if let Some(hook) = &self.on_read {
            hook(id, data);
        }
    }

    fn wrote(&self, id: BrokerId, count: usize) {
        if let Some(hook) = &self.on_write {
            hook(id, count);
        }
    }

    fn timeout(&self, id: BrokerId, op: Op) {
        if let Some(hook) = &self.on_timeout {
            hook(id, op);
        }
    }

    fn error(&self, id: BrokerId, err: &Error) {
        if let Some(hook) = &self.on_error {
            hook(id, err);
        }
    }

    fn connected(&self, id: BrokerId) {
        if let Some(hook) = &self.on_connect {
            hook(id);
        }
    }

    fn disconnected(&self, id: BrokerId) {
        if let Some(hook) = &self.on_disconnect {
            hook(id);
        }
    }
}

/// Event-id layout: four reactor slots per broker id.
const STRIDE: u64 = 4;

fn fd_event(id: BrokerId) -> EventId {
    id * STRIDE
}

fn read_timer(id: BrokerId) -> EventId {
    id * STRIDE + 1
}

fn write_timer(id: BrokerId) -> EventId {
    id * STRIDE + 2
}

fn connect_timer(id: BrokerId) -> EventId {
    id * STRIDE + 3
}

#[cfg(unix)]
fn connect_error_of(endpoint: &Endpoint) -> Result<Option<std::io::Error>> {
    endpoint.take_connect_error()
}

#[cfg(not(unix))]
fn connect_error_of(_endpoint: &Endpoint) -> Result<Option<std::io::Error>> {
    Ok(None)
}

/// Reactor-resident state of one live connection.
struct Conn {
    endpoint: Endpoint,
    marks: Marks,
    tx_limit: usize,
    staged: Vec<u8>,
    tx: VecDeque<Vec<u8>>,
    queued: usize,
    ready: bool,
    announced: bool,
    locked_read: Cell<bool>,
    locked_write: Cell<bool>,
    rearmed: Cell<bool>,
}

/// Shared machinery of the server and client cores. Cheap to clone; every
/// clone addresses the same reactor-local state.
#[derive(Clone)]
pub(crate) struct Core {
    dispatch: Dispatch,
    scheme: Scheme,
    engine: Rc<RefCell<Option<Arc<Engine>>>>,
    events: Rc<RefCell<Rc<Events>>>,
    registry: Rc<RefCell<Registry>>,
    conns: Rc<RefCell<HashMap<BrokerId, Conn>>>,
}

impl Core {
    pub(crate) fn new(dispatch: &Dispatch, scheme: Scheme) -> Self {
        Self {
            dispatch: dispatch.clone(),
            scheme,
            engine: Rc::new(RefCell::new(None)),
            events: Rc::new(RefCell::new(Rc::new(Events::default()))),
            registry: Rc::new(RefCell::new(Registry::new())),
            conns: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub(crate) fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub(crate) fn set_events(&self, events: Events) {
        *self.events.borrow_mut() = Rc::new(events);
    }

    pub(crate) fn set_engine(&self, engine: Arc<Engine>) {
        *self.engine.borrow_mut() = Some(engine);
    }

    pub(crate) fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.borrow().clone()
    }

    fn events(&self) -> Rc<Events> {
        Rc::clone(&self.events.borrow())
    }

    pub(crate) fn registry(&self) -> Rc<RefCell<Registry>> {
        Rc::clone(&self.registry)
    }

    pub(crate) fn next_id(&self) -> BrokerId {
        self.registry.borrow_mut().next_id()
    }

    /// Registers an endpoint's descriptor with the reactor and creates the
    /// broker. With `watch_connect` the core waits for connect completion
    /// first; otherwise the security handshake (if any) starts right away.
    pub(crate) fn register(
        &self,
        id: BrokerId,
        endpoint: Endpoint,
        watch_connect: bool,
    ) -> Result<()> {
        #[cfg(unix)]
        let fd = endpoint.socket();
        #[cfg(not(unix))]
        let fd = -1;
        let broker = Broker::new(
            id,
            self.scheme.id,
            fd,
            endpoint.peer_addr(),
            endpoint.local_addr(),
        );
        self.registry.borrow_mut().insert(broker);
        self.conns.borrow_mut().insert(
            id,
            Conn {
                endpoint,
                marks: self.scheme.marks,
                tx_limit: self.scheme.tx_limit.unwrap_or(usize::MAX),
                staged: Vec::new(),
                tx: VecDeque::new(),
                queued: 0,
                ready: false,
                announced: false,
                locked_read: Cell::new(false),
                locked_write: Cell::new(false),
                rearmed: Cell::new(false),
            },
        );

        let core = self.clone();
        self.dispatch.add_event(
            fd_event(id),
            fd,
            Rc::new(RefCell::new(move |_, kind| core.handle_event(id, kind))),
        )?;
        if watch_connect {
            self.dispatch.mode(fd_event(id), Kind::Connect, true)?;
            self.arm_timer(connect_timer(id), self.scheme.timeouts.connect_s, id, Op::Connect);
        } else {
            self.dispatch.mode(fd_event(id), Kind::Read, true)?;
            self.arm_timer(read_timer(id), self.scheme.timeouts.read_s, id, Op::Read);
            self.drive(id);
        }
        Ok(())
    }

    fn handle_event(&self, id: BrokerId, kind: Kind) {
        match kind {
            Kind::Read => self.on_readable(id),
            Kind::Write => self.on_writable(id),
            Kind::Connect => self.on_connected(id),
            Kind::Close => {
                let err = Error::transport("descriptor failed").with_context(format!("broker={id}"));
                self.events().error(id, &err);
                self.teardown(id);
                return;
            }
            Kind::Timer => {}
        }
        // Bytes queued from inside a callback while the write side was
        // locked still need a drain.
        let flush = {
            let conns = self.conns.borrow();
            conns
                .get(&id)
                .map(|c| c.ready && !c.locked_write.get() && !c.tx.is_empty())
                .unwrap_or(false)
        };
        if flush {
            self.pump_write(id);
        }
    }

    fn on_connected(&self, id: BrokerId) {
        self.dispatch.del(connect_timer(id));
        let pending = {
            let conns = self.conns.borrow();
            let Some(conn) = conns.get(&id) else { return };
            connect_error_of(&conn.endpoint)
        };
        match pending {
            Ok(None) => {}
            Ok(Some(os_err)) => {
                let err = Error::transport(format!("connect failed: {os_err}"))
                    .with_context(format!("broker={id}"));
                self.events().error(id, &err);
                self.teardown(id);
                return;
            }
            Err(err) => {
                self.events().error(id, &err);
                self.teardown(id);
                return;
            }
        }
        if self.dispatch.mode(fd_event(id), Kind::Read, true).is_err() {
            return;
        }
        self.arm_timer(read_timer(id), self.scheme.timeouts.read_s, id, Op::Read);
        self.drive(id);
    }

    /// Progresses the security handshake; announces the broker when done.
    fn drive(&self, id: BrokerId) {
        let step = {
            let mut conns = self.conns.borrow_mut();
            let Some(conn) = conns.get_mut(&id) else { return };
            if conn.ready {
                return;
            }
            conn.endpoint.handshake_step()
        };
        match step {
            Ok(Handshake::Done) => {
                let announce = {
                    let mut conns = self.conns.borrow_mut();
                    let Some(conn) = conns.get_mut(&id) else { return };
                    conn.ready = true;
                    !std::mem::replace(&mut conn.announced, true)
                };
                trace!(id, "broker established");
                if announce {
                    self.events().connected(id);
                }
                // Plaintext may already sit in the record layer.
                self.pump_read(id);
            }
            Ok(Handshake::WantRead) => {}
            Ok(Handshake::WantWrite) => {
                let _ = self.dispatch.mode(fd_event(id), Kind::Write, true);
            }
            Err(err) => {
                self.events().error(id, &err.with_context(format!("broker={id}")));
                self.teardown(id);
            }
        }
    }

    fn on_readable(&self, id: BrokerId) {
        let proceed = {
            let conns = self.conns.borrow();
            let Some(conn) = conns.get(&id) else { return };
            // The read direction never re-enters itself.
            if conn.locked_read.get() {
                return;
            }
            conn.locked_read.set(true);
            conn.ready
        };
        if proceed {
            self.pump_read(id);
        } else {
            self.drive(id);
        }
        if let Some(conn) = self.conns.borrow().get(&id) {
            conn.locked_read.set(false);
        }
    }

    fn on_writable(&self, id: BrokerId) {
        let ready = {
            let conns = self.conns.borrow();
            let Some(conn) = conns.get(&id) else { return };
            if conn.locked_write.get() {
                return;
            }
            conn.ready
        };
        if ready {
            self.pump_write(id);
        } else {
            // Write readiness only drives the handshake until established.
            let _ = self.dispatch.mode(fd_event(id), Kind::Write, false);
            self.drive(id);
        }
    }

    fn pump_read(&self, id: BrokerId) {
        let mut emitted: Vec<Vec<u8>> = Vec::new();
        let mut closed = false;
        let mut failure: Option<Error> = None;
        let mut progressed = false;
        {
            let mut conns = self.conns.borrow_mut();
            let Some(conn) = conns.get_mut(&id) else { return };
            let cap = conn.marks.read.max.clamp(2048, 256 * 1024);
            let mut buf = vec![0u8; cap];
            loop {
                match conn.endpoint.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(count) => {
                        progressed = true;
                        conn.staged.extend_from_slice(&buf[..count]);
                        // The max mark bounds staging even mid-readiness.
                        if conn.staged.len() >= conn.marks.read.max {
                            for chunk in conn.staged.chunks(conn.marks.read.max) {
                                emitted.push(chunk.to_vec());
                            }
                            conn.staged.clear();
                        }
                    }
                    Err(IoKind::WouldBlock | IoKind::TlsWantRead) => break,
                    Err(IoKind::TlsWantWrite) => {
                        let _ = self.dispatch.mode(fd_event(id), Kind::Write, true);
                        break;
                    }
                    Err(IoKind::Interrupted) => continue,
                    Err(IoKind::Closed) => {
                        closed = true;
                        break;
                    }
                    Err(IoKind::Fatal) => {
                        failure = Some(
                            Error::transport("read failed")
                                .with_context(format!("broker={id}")),
                        );
                        break;
                    }
                }
            }
            // Coalesce below the min mark unless the stream is ending.
            if (conn.staged.len() >= conn.marks.read.min || closed || failure.is_some())
                && !conn.staged.is_empty()
            {
                for chunk in conn.staged.chunks(conn.marks.read.max) {
                    emitted.push(chunk.to_vec());
                }
                conn.staged.clear();
            }
        }

        let events = self.events();
        for chunk in &emitted {
            // A handler may have closed the broker mid-delivery.
            if !self.conns.borrow().contains_key(&id) {
                return;
            }
            events.read(id, chunk);
        }
        if progressed && self.conns.borrow().contains_key(&id) {
            self.arm_timer(read_timer(id), self.scheme.timeouts.read_s, id, Op::Read);
        }
        if let Some(err) = failure {
            events.error(id, &err);
            self.teardown(id);
        } else if closed {
            debug!(id, "peer closed");
            self.teardown(id);
        }
    }

    fn pump_write(&self, id: BrokerId) {
        {
            let conns = self.conns.borrow();
            let Some(conn) = conns.get(&id) else { return };
            // The write direction never re-enters itself.
            if conn.locked_write.get() {
                return;
            }
            conn.locked_write.set(true);
        }
        loop {
            let mut wrote = 0usize;
            let mut blocked = false;
            let mut closed = false;
            let mut failure: Option<Error> = None;
            {
                let mut conns = self.conns.borrow_mut();
                let Some(conn) = conns.get_mut(&id) else { return };
                while let Some(front) = conn.tx.front_mut() {
                    match conn.endpoint.write(front) {
                        Ok(count) => {
                            wrote += count;
                            conn.queued -= count;
                            if count == front.len() {
                                conn.tx.pop_front();
                            } else {
                                // Partial write: the remainder stays queued.
                                front.drain(..count);
                            }
                        }
                        Err(IoKind::WouldBlock | IoKind::TlsWantWrite) => {
                            blocked = true;
                            break;
                        }
                        Err(IoKind::TlsWantRead) => break,
                        Err(IoKind::Interrupted) => continue,
                        Err(IoKind::Closed) => {
                            closed = true;
                            break;
                        }
                        Err(IoKind::Fatal) => {
                            failure = Some(
                                Error::transport("write failed")
                                    .with_context(format!("broker={id}")),
                            );
                            break;
                        }
                    }
                }
            }

            if wrote > 0 {
                self.events().wrote(id, wrote);
            }
            if let Some(err) = failure {
                self.events().error(id, &err);
                self.teardown(id);
                return;
            }
            if closed {
                self.teardown(id);
                return;
            }
            // The wrote handler may have closed the broker.
            let Some((empty, more)) = self
                .conns
                .borrow()
                .get(&id)
                .map(|c| (c.tx.is_empty(), !c.tx.is_empty() && !blocked))
            else {
                return;
            };
            if empty {
                let _ = self.dispatch.mode(fd_event(id), Kind::Write, false);
                self.dispatch.del(write_timer(id));
            } else if blocked {
                let _ = self.dispatch.mode(fd_event(id), Kind::Write, true);
                self.arm_timer(write_timer(id), self.scheme.timeouts.write_s, id, Op::Write);
            }
            if !more {
                break;
            }
            // Bytes queued from inside the wrote handler drain now.
        }
        if let Some(conn) = self.conns.borrow().get(&id) {
            conn.locked_write.set(false);
        }
    }

    fn arm_timer(&self, timer: EventId, seconds: u64, id: BrokerId, op: Op) {
        self.dispatch.del(timer);
        if seconds == 0 {
            return;
        }
        let core = self.clone();
        let outcome = self.dispatch.add_timer(
            timer,
            Duration::from_secs(seconds),
            false,
            Rc::new(RefCell::new(move |_, _| core.on_op_timeout(id, op))),
        );
        if let Err(err) = outcome {
            warn!(id, "timer registration failed: {err}");
        }
    }

    fn on_op_timeout(&self, id: BrokerId, op: Op) {
        {
            let conns = self.conns.borrow();
            if let Some(conn) = conns.get(&id) {
                conn.rearmed.set(false);
            } else {
                return;
            }
        }
        self.events().timeout(id, op);
        // The handler may keep the broker alive by re-arming.
        let rearmed = self
            .conns
            .borrow()
            .get(&id)
            .map(|c| c.rearmed.get())
            .unwrap_or(false);
        if rearmed {
            let seconds = match op {
                Op::Read => self.scheme.timeouts.read_s,
                Op::Write => self.scheme.timeouts.write_s,
                Op::Connect => self.scheme.timeouts.connect_s,
            };
            let timer = match op {
                Op::Read => read_timer(id),
                Op::Write => write_timer(id),
                Op::Connect => connect_timer(id),
            };
            self.arm_timer(timer, seconds, id, op);
        } else {
            self.teardown(id);
        }
    }

    /// Keeps the broker alive across the current timeout callback.
    pub(crate) fn rearm(&self, id: BrokerId) {
        if let Some(conn) = self.conns.borrow().get(&id) {
            conn.rearmed.set(true);
        }
    }

    /// Surfaces a failure for a broker (possibly one that never finished
    /// registering) and tears down whatever exists under the id.
    pub(crate) fn report_error(&self, id: BrokerId, err: &Error) {
        self.events().error(id, err);
        self.teardown(id);
    }

    /// Queues bytes for FIFO delivery under write readiness.
    pub(crate) fn send(&self, id: BrokerId, data: Vec<u8>) -> Result<()> {
        let over_limit = {
            let mut conns = self.conns.borrow_mut();
            let Some(conn) = conns.get_mut(&id) else {
                return Err(Error::cancelled(format!("unknown broker {id}")));
            };
            if conn.queued + data.len() > conn.tx_limit {
                true
            } else {
                conn.queued += data.len();
                conn.tx.push_back(data);
                false
            }
        };
        if over_limit {
            let err = Error::limit("tx queue bound exceeded").with_context(format!("broker={id}"));
            self.events().error(id, &err);
            return Err(Error::limit("tx queue bound exceeded"));
        }
        self.pump_write(id);
        Ok(())
    }

    /// Closes a broker; no READ/WRITE/TIMER callbacks fire afterwards.
    pub(crate) fn close(&self, id: BrokerId) {
        self.teardown(id);
    }

    /// Re-derives the marks from link bandwidth (bits per second).
    pub(crate) fn bandwidth(&self, id: BrokerId, read_bps: u64, write_bps: u64) {
        let mut conns = self.conns.borrow_mut();
        if let Some(conn) = conns.get_mut(&id) {
            conn.marks = marks_for_bandwidth(read_bps, write_bps);
            #[cfg(unix)]
            let _ = conn
                .endpoint
                .buffer_size(conn.marks.read.max, conn.marks.write.max);
        }
    }

    fn teardown(&self, id: BrokerId) {
        let conn = self.conns.borrow_mut().remove(&id);
        let Some(mut conn) = conn else { return };
        self.dispatch.del(fd_event(id));
        self.dispatch.del(read_timer(id));
        self.dispatch.del(write_timer(id));
        self.dispatch.del(connect_timer(id));
        self.registry.borrow_mut().remove(id);
        let _ = conn.endpoint.shutdown();
        debug!(id, "broker closed");
        self.events().disconnected(id);
    }
}
