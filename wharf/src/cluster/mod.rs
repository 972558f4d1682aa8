//! Fork-based worker cluster with supervised restart.
//!
//! The master forks `count` workers per scheme, each wired back through a
//! socketpair speaking the chunked message protocol from [`cmp`]. The
//! master side is reactor-resident: every worker pipe registers its
//! descriptor with the owning [`Dispatch`](crate::dispatch::Dispatch), and
//! a SIGCHLD interception on that same reactor reaps dead workers and,
//! when restart is enabled, respawns the lost slot with a fresh pid and a
//! new socketpair.
//!
//! The cluster may only be configured from the master thread before any
//! worker loop starts; configuration mutation after `start` is rejected.
//! On platforms without `fork` every operation reports `OsBroken` and
//! becomes a no-op.

mod cmp;

pub use cmp::{Assembler, CmpCodec, Delivery, Frame, Header, Mode, Splitter, CHUNK_SIZE, HEADER_LEN};

use std::sync::Arc;

use crate::errors::{Error, Result};

/// Cluster behavior knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Respawn a worker slot when its process dies.
    pub restart: bool,
    /// Watch SIGCHLD and surface worker exits even without restart.
    pub track_crash: bool,
    /// Deliver worker messages on a dedicated consumer thread instead of
    /// the reactor thread.
    pub async_messages: bool,
    /// Chunk ceiling for the IPC framing.
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            restart: false,
            track_crash: true,
            async_messages: false,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// Supervisor notifications.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker came up.
    Ready { scheme: u16, pid: u32 },
    /// A worker exited; `status` is the raw wait status.
    Exit { scheme: u16, pid: u32, status: i32 },
    /// A dead slot was refilled.
    Respawn { scheme: u16, old_pid: u32, pid: u32 },
}

/// Handler for records a worker sent to the master. `Send + Sync` so the
/// async delivery mode can run it off-thread.
pub type MessageHandler = Arc<dyn Fn(u16, u32, Vec<u8>) + Send + Sync>;
/// Handler for supervisor events; runs on the reactor thread.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;
/// Worker entry point, run inside the forked child.
pub type WorkerEntry = Arc<dyn Fn(WorkerChannel) + Send + Sync>;

#[cfg(unix)]
pub use imp::{Cluster, WorkerChannel};

#[cfg(not(unix))]
pub use broken::{Cluster, WorkerChannel};

/// Shared by both implementations: scheme bookkeeping.
struct Slot {
    count: u16,
    restart: bool,
    entry: Option<WorkerEntry>,
    started: bool,
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd};
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::rc::Rc;

    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};
    use tracing::{debug, error, warn};

    use crate::cluster::cmp::{Assembler, CmpCodec, Splitter};
    use crate::dispatch::{Dispatch, EventId, Kind, SignalSet};

    /// Worker pipes get their own event-id range, clear of the broker ids.
    const EVENT_BASE: EventId = 1 << 48;

    /// Child-side half of the IPC socketpair, synchronous by design: the
    /// worker decides whether to build its own reactor around it.
    pub struct WorkerChannel {
        stream: StdUnixStream,
        splitter: Splitter,
        assembler: Assembler,
        buffer: Vec<u8>,
        chunk_size: usize,
    }

    impl WorkerChannel {
        fn new(stream: StdUnixStream, chunk_size: usize) -> Self {
            let pid = std::process::id();
            let mut splitter = Splitter::new(pid);
            splitter.chunk_size(chunk_size);
            Self {
                stream,
                splitter,
                assembler: Assembler::new(),
                buffer: Vec::new(),
                chunk_size,
            }
        }

        pub fn pid(&self) -> u32 {
            std::process::id()
        }

        /// Sends one record to the master. Blocks when the pipe is full.
        pub fn send(&mut self, record: &[u8]) -> Result<()> {
            let mut codec = CmpCodec;
            let mut wire = BytesMut::new();
            for frame in self.splitter.split(record) {
                codec.encode(frame, &mut wire)?;
            }
            self.stream.write_all(&wire)?;
            Ok(())
        }

        /// Blocks until one full record from the master is assembled.
        pub fn recv(&mut self) -> Result<Delivery> {
            let mut codec = CmpCodec;
            let mut chunk = vec![0u8; self.chunk_size + HEADER_LEN];
            let mut staged = BytesMut::from(&self.buffer[..]);
            self.buffer.clear();
            loop {
                while let Some(frame) = codec.decode(&mut staged)? {
                    if let Some(delivery) = self.assembler.push(frame) {
                        self.buffer.extend_from_slice(&staged);
                        return Ok(delivery);
                    }
                }
                let read = self.stream.read(&mut chunk)?;
                if read == 0 {
                    return Err(Error::transport("master closed the IPC pipe"));
                }
                staged.extend_from_slice(&chunk[..read]);
            }
        }
    }

    #[cfg(test)]
    impl WorkerChannel {
        pub(crate) fn test_new(stream: StdUnixStream, chunk_size: usize) -> Self {
            Self::new(stream, chunk_size)
        }
    }

    #[cfg(test)]
    impl Cluster {
        pub(crate) fn mark_started_for_test(&self, scheme: u16) {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.slots.get_mut(&scheme) {
                slot.started = true;
            }
        }
    }

    /// Master-side state of one worker pipe.
    struct Worker {
        slot: u16,
        scheme: u16,
        pid: u32,
        stream: StdUnixStream,
        assembler: Assembler,
        inbound: BytesMut,
        outbound: Vec<u8>,
    }

    struct Inner {
        slots: HashMap<u16, super::Slot>,
        workers: HashMap<EventId, Worker>,
        next_event: EventId,
        on_message: Option<MessageHandler>,
        on_event: Option<EventHandler>,
        supervised: bool,
        async_tx: Option<std::sync::mpsc::Sender<(u16, u32, Vec<u8>)>>,
    }

    /// Master-side cluster handle, resident on one reactor.
    #[derive(Clone)]
    pub struct Cluster {
        config: Config,
        dispatch: Dispatch,
        splitter: Rc<RefCell<Splitter>>,
        inner: Rc<RefCell<Inner>>,
    }

    impl Cluster {
        pub fn new(dispatch: &Dispatch, config: Config) -> Self {
            let pid = std::process::id();
            let mut splitter = Splitter::new(pid);
            splitter.chunk_size(config.chunk_size);
            Self {
                config,
                dispatch: dispatch.clone(),
                splitter: Rc::new(RefCell::new(splitter)),
                inner: Rc::new(RefCell::new(Inner {
                    slots: HashMap::new(),
                    workers: HashMap::new(),
                    next_event: EVENT_BASE,
                    on_message: None,
                    on_event: None,
                    supervised: false,
                    // Created lazily once an async handler is installed.
                    async_tx: None,
                })),
            }
        }

        /// Installs the handler for worker→master records. With
        /// `async_messages` a dedicated consumer thread is started and
        /// deliveries cross over to it.
        pub fn on_message(&self, handler: MessageHandler) {
            let mut inner = self.inner.borrow_mut();
            if self.config.async_messages && inner.async_tx.is_none() {
                let (tx, rx) = std::sync::mpsc::channel::<(u16, u32, Vec<u8>)>();
                let consumer = Arc::clone(&handler);
                std::thread::spawn(move || {
                    while let Ok((scheme, pid, data)) = rx.recv() {
                        consumer(scheme, pid, data);
                    }
                });
                inner.async_tx = Some(tx);
            }
            inner.on_message = Some(handler);
        }

        /// Installs the supervisor event handler.
        pub fn on_event(&self, handler: EventHandler) {
            self.inner.borrow_mut().on_event = Some(handler);
        }

        /// Declares a scheme with `count` worker slots.
        pub fn init(&self, scheme: u16, count: u16) -> Result<()> {
            let mut inner = self.inner.borrow_mut();
            if inner.slots.get(&scheme).map(|s| s.started).unwrap_or(false) {
                return Err(Error::cluster("scheme already started"));
            }
            inner.slots.insert(
                scheme,
                super::Slot {
                    count: count.max(1),
                    restart: self.config.restart,
                    entry: None,
                    started: false,
                },
            );
            Ok(())
        }

        /// Toggles respawn-on-death for a scheme. Rejected after start.
        pub fn restart(&self, scheme: u16, flag: bool) -> Result<()> {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .slots
                .get_mut(&scheme)
                .ok_or_else(|| Error::cluster("unknown scheme"))?;
            if slot.started {
                return Err(Error::cluster("scheme already started"));
            }
            slot.restart = flag;
            Ok(())
        }

        /// Sets the worker entry point for a scheme. Rejected after start.
        pub fn worker(&self, scheme: u16, entry: WorkerEntry) -> Result<()> {
            let mut inner = self.inner.borrow_mut();
            let slot = inner
                .slots
                .get_mut(&scheme)
                .ok_or_else(|| Error::cluster("unknown scheme"))?;
            if slot.started {
                return Err(Error::cluster("scheme already started"));
            }
            slot.entry = Some(entry);
            Ok(())
        }

        /// Forks the scheme's workers and registers their pipes with the
        /// reactor.
        pub fn start(&self, scheme: u16) -> Result<()> {
            let (count, entry) = {
                let mut inner = self.inner.borrow_mut();
                let slot = inner
                    .slots
                    .get_mut(&scheme)
                    .ok_or_else(|| Error::cluster("unknown scheme"))?;
                if slot.started {
                    return Err(Error::cluster("scheme already started"));
                }
                let entry = slot
                    .entry
                    .clone()
                    .ok_or_else(|| Error::cluster("no worker entry installed"))?;
                slot.started = true;
                (slot.count, entry)
            };
            self.supervise();
            for id in 0..count {
                self.spawn_worker(scheme, id, &entry)?;
            }
            Ok(())
        }

        /// Stops a scheme's workers with SIGTERM and clears the slots.
        pub fn stop(&self, scheme: u16) {
            let removed: Vec<(EventId, u32)> = {
                let mut inner = self.inner.borrow_mut();
                let events: Vec<EventId> = inner
                    .workers
                    .iter()
                    .filter(|(_, worker)| worker.scheme == scheme)
                    .map(|(event, _)| *event)
                    .collect();
                let mut out = Vec::new();
                for event in events {
                    if let Some(worker) = inner.workers.remove(&event) {
                        out.push((event, worker.pid));
                    }
                }
                if let Some(slot) = inner.slots.get_mut(&scheme) {
                    slot.started = false;
                }
                out
            };
            for (event, pid) in removed {
                self.dispatch.del(event);
                // SAFETY: signalling a child pid owned by this master.
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
        }

        /// Sends a record to a specific worker.
        pub fn send(&self, scheme: u16, pid: u32, record: &[u8]) -> Result<()> {
            let event = {
                let inner = self.inner.borrow();
                inner
                    .workers
                    .iter()
                    .find(|(_, w)| w.scheme == scheme && w.pid == pid)
                    .map(|(event, _)| *event)
            }
            .ok_or_else(|| Error::cluster(format!("no worker {pid} in scheme {scheme}")))?;
            self.enqueue(event, record);
            self.flush(event);
            Ok(())
        }

        /// Sends a record to every worker of a scheme.
        pub fn broadcast(&self, scheme: u16, record: &[u8]) -> Result<()> {
            let events: Vec<EventId> = {
                let inner = self.inner.borrow();
                inner
                    .workers
                    .iter()
                    .filter(|(_, w)| w.scheme == scheme)
                    .map(|(event, _)| *event)
                    .collect()
            };
            if events.is_empty() {
                return Err(Error::cluster(format!("unknown scheme {scheme}")));
            }
            for event in events {
                self.enqueue(event, record);
                self.flush(event);
            }
            Ok(())
        }

        /// Current worker pids of a scheme.
        pub fn pids(&self, scheme: u16) -> Vec<u32> {
            let inner = self.inner.borrow();
            let mut pids: Vec<u32> = inner
                .workers
                .values()
                .filter(|w| w.scheme == scheme)
                .map(|w| w.pid)
                .collect();
            pids.sort_unstable();
            pids
        }

        fn emit(&self, event: Event) {
            let handler = self.inner.borrow().on_event.clone();
            if let Some(handler) = handler {
                handler(event);
            }
        }

        fn enqueue(&self, event: EventId, record: &[u8]) {
            let frames = self.splitter.borrow_mut().split(record);
            let mut inner = self.inner.borrow_mut();
            let Some(worker) = inner.workers.get_mut(&event) else { return };
            let mut codec = CmpCodec;
            let mut wire = BytesMut::new();
            for frame in frames {
                if codec.encode(frame, &mut wire).is_err() {
                    return;
                }
            }
            worker.outbound.extend_from_slice(&wire);
        }

        /// Drains a worker's outbound buffer; write readiness is enabled
        /// only while the pipe pushes back.
        fn flush(&self, event: EventId) {
            let blocked = {
                let mut inner = self.inner.borrow_mut();
                let Some(worker) = inner.workers.get_mut(&event) else { return };
                let mut blocked = false;
                while !worker.outbound.is_empty() {
                    match worker.stream.write(&worker.outbound) {
                        Ok(written) => {
                            worker.outbound.drain(..written);
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            blocked = true;
                            break;
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(pid = worker.pid, "worker pipe write failed: {err}");
                            break;
                        }
                    }
                }
                blocked
            };
            let _ = self.dispatch.mode(event, Kind::Write, blocked);
        }

        /// Reads everything ready on a worker pipe and delivers completed
        /// records.
        fn pipe_readable(&self, event: EventId) {
            let mut deliveries = Vec::new();
            let mut dead = false;
            {
                let mut inner = self.inner.borrow_mut();
                let Some(worker) = inner.workers.get_mut(&event) else { return };
                let mut chunk = [0u8; 16 * 1024];
                loop {
                    match worker.stream.read(&mut chunk) {
                        Ok(0) => {
                            dead = true;
                            break;
                        }
                        Ok(read) => {
                            worker.inbound.extend_from_slice(&chunk[..read]);
                            let mut codec = CmpCodec;
                            loop {
                                match codec.decode(&mut worker.inbound) {
                                    Ok(Some(frame)) => {
                                        if let Some(delivery) = worker.assembler.push(frame) {
                                            deliveries.push((worker.scheme, delivery));
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(err) => {
                                        warn!(pid = worker.pid, "bad IPC frame: {err}");
                                        dead = true;
                                        break;
                                    }
                                }
                            }
                            if dead {
                                break;
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            debug!(pid = worker.pid, "worker pipe read failed: {err}");
                            dead = true;
                            break;
                        }
                    }
                }
            }
            let (handler, async_tx) = {
                let inner = self.inner.borrow();
                (inner.on_message.clone(), inner.async_tx.clone())
            };
            for (scheme, delivery) in deliveries {
                if let Some(tx) = &async_tx {
                    let _ = tx.send((scheme, delivery.pid, delivery.data));
                } else if let Some(handler) = &handler {
                    handler(scheme, delivery.pid, delivery.data);
                }
            }
            if dead {
                // The pipe is gone; SIGCHLD handles the process itself.
                self.dispatch.del(event);
                self.inner.borrow_mut().workers.remove(&event);
            }
        }

        fn spawn_worker(&self, scheme: u16, id: u16, entry: &WorkerEntry) -> Result<()> {
            let mut fds = [0i32; 2];
            // SAFETY: plain socketpair(2) call with a valid out array.
            if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }
                != 0
            {
                return Err(Error::cluster(format!(
                    "socketpair failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            // SAFETY: fork(2); the child only touches its own pipe end and
            // never the parent's reactor state.
            let pid = unsafe { libc::fork() };
            match pid {
                -1 => {
                    // SAFETY: closing the fds we just created.
                    unsafe {
                        libc::close(fds[0]);
                        libc::close(fds[1]);
                    }
                    Err(Error::cluster(format!(
                        "fork failed: {}",
                        std::io::Error::last_os_error()
                    )))
                }
                0 => {
                    // Child. The parent's end is not ours to keep.
                    // SAFETY: closing the parent's fd, wrapping our own.
                    let stream = unsafe {
                        libc::close(fds[0]);
                        StdUnixStream::from_raw_fd(fds[1])
                    };
                    let channel = WorkerChannel::new(stream, self.config.chunk_size);
                    entry(channel);
                    std::process::exit(0);
                }
                child_pid => {
                    // Parent.
                    // SAFETY: closing the child's fd, wrapping our own.
                    let stream = unsafe {
                        libc::close(fds[1]);
                        StdUnixStream::from_raw_fd(fds[0])
                    };
                    stream.set_nonblocking(true)?;
                    let worker_pid = child_pid as u32;

                    let event = {
                        let mut inner = self.inner.borrow_mut();
                        let event = inner.next_event;
                        inner.next_event += 1;
                        inner.workers.insert(
                            event,
                            Worker {
                                slot: id,
                                scheme,
                                pid: worker_pid,
                                stream,
                                assembler: Assembler::new(),
                                inbound: BytesMut::new(),
                                outbound: Vec::new(),
                            },
                        );
                        event
                    };
                    let fd = {
                        let inner = self.inner.borrow();
                        inner.workers[&event].stream.as_raw_fd()
                    };
                    let this = self.clone();
                    self.dispatch.add_event(
                        event,
                        fd,
                        Rc::new(RefCell::new(move |_, kind| match kind {
                            Kind::Read => this.pipe_readable(event),
                            Kind::Write => this.flush(event),
                            Kind::Close => {
                                this.dispatch.del(event);
                                this.inner.borrow_mut().workers.remove(&event);
                            }
                            _ => {}
                        })),
                    )?;
                    self.dispatch.mode(event, Kind::Read, true)?;

                    self.emit(Event::Ready {
                        scheme,
                        pid: worker_pid,
                    });
                    Ok(())
                }
            }
        }

        /// Installs the SIGCHLD interception on the reactor; idempotent.
        /// Runs automatically at the first `start`.
        pub fn supervise(&self) {
            if !(self.config.track_crash || self.config.restart) {
                return;
            }
            {
                let mut inner = self.inner.borrow_mut();
                if inner.supervised {
                    return;
                }
                inner.supervised = true;
            }
            let this = self.clone();
            self.dispatch.signals(
                SignalSet::child_only(),
                Rc::new(RefCell::new(move |_| this.reap_exited())),
            );
        }

        fn reap_exited(&self) {
            loop {
                let mut status = 0i32;
                // SAFETY: non-blocking reap of our own children.
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    return;
                }
                self.reap(pid as u32, status);
            }
        }

        fn reap(&self, pid: u32, status: i32) {
            let removed = {
                let mut inner = self.inner.borrow_mut();
                let event = inner
                    .workers
                    .iter()
                    .find(|(_, w)| w.pid == pid)
                    .map(|(event, _)| *event);
                event.and_then(|event| {
                    inner
                        .workers
                        .remove(&event)
                        .map(|worker| (event, worker.scheme, worker.slot))
                })
            };
            let Some((event, scheme, slot_id)) = removed else {
                return;
            };
            self.dispatch.del(event);
            self.emit(Event::Exit {
                scheme,
                pid,
                status,
            });
            let (restart, entry) = {
                let inner = self.inner.borrow();
                match inner.slots.get(&scheme) {
                    Some(slot) if slot.started => (slot.restart, slot.entry.clone()),
                    _ => (false, None),
                }
            };
            if restart {
                if let Some(entry) = entry {
                    match self.spawn_worker(scheme, slot_id, &entry) {
                        Ok(()) => {
                            let new_pid =
                                self.pids(scheme).last().copied().unwrap_or_default();
                            self.emit(Event::Respawn {
                                scheme,
                                old_pid: pid,
                                pid: new_pid,
                            });
                        }
                        Err(err) => error!("respawn of scheme {scheme} failed: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod broken {
    use super::*;
    use crate::dispatch::Dispatch;

    /// Stand-in on platforms without `fork`.
    pub struct WorkerChannel;

    impl WorkerChannel {
        pub fn send(&mut self, _record: &[u8]) -> Result<()> {
            Err(Error::os_broken("cluster requires fork"))
        }

        pub fn recv(&mut self) -> Result<Delivery> {
            Err(Error::os_broken("cluster requires fork"))
        }
    }

    /// Every operation reports `OsBroken` and is otherwise a no-op.
    pub struct Cluster;

    impl Cluster {
        pub fn new(_dispatch: &Dispatch, _config: Config) -> Self {
            Self
        }

        pub fn on_message(&self, _handler: MessageHandler) {}

        pub fn on_event(&self, _handler: EventHandler) {}

        pub fn init(&self, _scheme: u16, _count: u16) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn restart(&self, _scheme: u16, _flag: bool) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn worker(&self, _scheme: u16, _entry: WorkerEntry) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn start(&self, _scheme: u16) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn stop(&self, _scheme: u16) {}

        pub fn send(&self, _scheme: u16, _pid: u32, _record: &[u8]) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn broadcast(&self, _scheme: u16, _record: &[u8]) -> Result<()> {
            Err(Error::os_broken("cluster is unsupported on this platform"))
        }

        pub fn supervise(&self) {}
    }
}
