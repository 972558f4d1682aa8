//! Single-threaded cooperative reactor.
//!
//! One [`Dispatch`] owns one OS thread: a current-thread runtime plus a
//! `LocalSet` form the multiplexer handle, and every registered callback runs
//! on that thread, never in parallel with another. Events are keyed by a
//! caller-chosen id and may watch fd readiness (read/write/connect/close) or
//! a relative timer; masks toggle at runtime, callbacks may add or remove
//! events — including their own — mid-dispatch, and removal cancels any
//! pending dispatch of the removed kind.
//!
//! Cross-thread interaction goes through the [`Waker`]: `kick()` unblocks the
//! loop, `submit()` queues a closure the loop drains on its next tick, and
//! `stop()` ends it. `rebase()` rebuilds the multiplexer while keeping every
//! registration — the fork-child pattern: fork, rebase, start.

mod signals;

pub use signals::SignalSet;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{watch, Notify};
use tokio::task::LocalSet;
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};

/// Caller-chosen event key.
pub type EventId = u64;

/// Kinds an event callback can be dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Read,
    Write,
    Connect,
    Timer,
    Close,
}

/// Event callback; runs on the reactor thread.
pub type Callback = Rc<RefCell<dyn FnMut(EventId, Kind)>>;

/// Signal callback; runs on the reactor thread.
pub type SignalCallback = Rc<RefCell<dyn FnMut(i32)>>;

const MASK_READ: u8 = 0b0001;
const MASK_WRITE: u8 = 0b0010;
const MASK_CONNECT: u8 = 0b0100;
const MASK_TIMER: u8 = 0b1000;

fn mask_bit(kind: Kind) -> u8 {
    match kind {
        Kind::Read => MASK_READ,
        Kind::Write => MASK_WRITE,
        Kind::Connect => MASK_CONNECT,
        Kind::Timer => MASK_TIMER,
        Kind::Close => 0,
    }
}

struct TimerSpec {
    delay: Duration,
    recurrent: bool,
}

struct Entry {
    fd: Option<std::os::fd::RawFd>,
    timer: Option<TimerSpec>,
    callback: Callback,
    mask_tx: watch::Sender<u8>,
    abort: Option<tokio::task::AbortHandle>,
}

struct Inner {
    events: HashMap<EventId, Entry>,
    freeze_tx: watch::Sender<bool>,
    frequency: Duration,
    easy: bool,
    signals: Vec<(SignalSet, SignalCallback)>,
    local_jobs: Vec<Box<dyn FnOnce()>>,
}

/// Cross-thread handle: wake, submit, stop.
#[derive(Clone)]
pub struct Waker {
    shared: Arc<Shared>,
}

struct Shared {
    wake: Notify,
    queue: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    running: AtomicBool,
    stopping: AtomicBool,
}

impl Waker {
    /// Wakes the loop from any thread.
    pub fn kick(&self) {
        self.shared.wake.notify_one();
    }

    /// Queues a closure for the loop to run on its next tick.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.shared
            .queue
            .lock()
            .expect("dispatch queue lock poisoned")
            .push(Box::new(job));
        self.kick();
    }

    /// Asks the loop to finish its current tick and return.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.kick();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// The reactor.
#[derive(Clone)]
pub struct Dispatch {
    inner: Rc<RefCell<Inner>>,
    shared: Arc<Shared>,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch {
    pub fn new() -> Self {
        let (freeze_tx, _) = watch::channel(false);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                events: HashMap::new(),
                freeze_tx,
                frequency: Duration::from_millis(10),
                easy: false,
                signals: Vec::new(),
                local_jobs: Vec::new(),
            })),
            shared: Arc::new(Shared {
                wake: Notify::new(),
                queue: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Cross-thread handle bound to this reactor.
    pub fn waker(&self) -> Waker {
        Waker {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers an fd readiness event. Masks start disabled; enable kinds
    /// with [`Dispatch::mode`]. Fails when `id` is already in use.
    pub fn add_event(
        &self,
        id: EventId,
        fd: std::os::fd::RawFd,
        callback: Callback,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.events.contains_key(&id) {
            return Err(Error::cancelled(format!("event id {id} already in use")));
        }
        let (mask_tx, _) = watch::channel(0u8);
        let mut entry = Entry {
            fd: Some(fd),
            timer: None,
            callback,
            mask_tx,
            abort: None,
        };
        if self.shared.running.load(Ordering::SeqCst) {
            let freeze_rx = inner.freeze_tx.subscribe();
            entry.abort = Some(self.spawn_fd_watcher(id, &entry, freeze_rx));
        }
        inner.events.insert(id, entry);
        Ok(())
    }

    /// Registers a relative timer. The timer mask starts enabled; the
    /// callback fires with [`Kind::Timer`] at or after each deadline, once
    /// unless `recurrent`.
    pub fn add_timer(
        &self,
        id: EventId,
        delay: Duration,
        recurrent: bool,
        callback: Callback,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.events.contains_key(&id) {
            return Err(Error::cancelled(format!("event id {id} already in use")));
        }
        let (mask_tx, _) = watch::channel(MASK_TIMER);
        let mut entry = Entry {
            fd: None,
            timer: Some(TimerSpec { delay, recurrent }),
            callback,
            mask_tx,
            abort: None,
        };
        if self.shared.running.load(Ordering::SeqCst) {
            entry.abort = Some(self.spawn_timer(id, &entry));
        }
        inner.events.insert(id, entry);
        Ok(())
    }

    /// Enables or disables one kind of an event.
    pub fn mode(&self, id: EventId, kind: Kind, enabled: bool) -> Result<()> {
        let inner = self.inner.borrow();
        let entry = inner
            .events
            .get(&id)
            .ok_or_else(|| Error::cancelled(format!("unknown event id {id}")))?;
        let bit = mask_bit(kind);
        entry.mask_tx.send_modify(|mask| {
            if enabled {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        });
        Ok(())
    }

    /// Disables one kind; the whole event stays registered.
    pub fn del_kind(&self, id: EventId, kind: Kind) -> Result<()> {
        self.mode(id, kind, false)
    }

    /// Removes an event entirely, cancelling any pending dispatch.
    pub fn del(&self, id: EventId) {
        let entry = self.inner.borrow_mut().events.remove(&id);
        if let Some(entry) = entry {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
            trace!(id, "event removed");
        }
    }

    /// Number of registered events.
    pub fn len(&self) -> usize {
        self.inner.borrow().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().events.is_empty()
    }

    /// Blocks dispatch of READ/WRITE; TIMER and CONNECT keep running.
    pub fn freeze(&self, on: bool) {
        self.inner.borrow().freeze_tx.send_replace(on);
        debug!(on, "dispatch freeze");
    }

    /// Single-shot poll mode: `start()` processes one quantum and returns.
    pub fn easy(&self, on: bool) {
        self.inner.borrow_mut().easy = on;
    }

    /// Caps the wait between queue-drain ticks. Default 10 ms.
    pub fn frequency(&self, interval: Duration) {
        self.inner.borrow_mut().frequency = interval.max(Duration::from_millis(1));
    }

    /// Adds a signal interception; several callers (embedder, cluster) may
    /// each watch their own set.
    pub fn signals(&self, set: SignalSet, callback: SignalCallback) {
        self.inner.borrow_mut().signals.push((set, callback));
    }

    /// Queues a closure to run on the loop thread inside the runtime
    /// context, on the next tick. Owner-thread only (closures may capture
    /// reactor-local state); cross-thread work goes through
    /// [`Waker::submit`].
    pub fn defer(&self, job: Box<dyn FnOnce()>) {
        self.inner.borrow_mut().local_jobs.push(job);
        self.kick();
    }

    /// Wakes the loop from any thread.
    pub fn kick(&self) {
        self.shared.wake.notify_one();
    }

    /// Asks a running loop to stop after the current tick. Idempotent.
    pub fn stop(&self) {
        self.waker().stop();
    }

    /// Rebuilds the multiplexer handle while keeping all registrations.
    /// The fork-child sequence is fork → `rebase()` → `start()`.
    pub fn rebase(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::cancelled("rebase needs a stopped dispatch"));
        }
        // The runtime is rebuilt on every start; stale abort handles from a
        // pre-fork parent loop must not leak into the child.
        let mut inner = self.inner.borrow_mut();
        for entry in inner.events.values_mut() {
            entry.abort = None;
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        debug!("dispatch rebased");
        Ok(())
    }

    /// Runs the loop on the calling thread until [`Dispatch::stop`] (or one
    /// quantum in easy mode). Idempotent: a second concurrent start returns
    /// immediately.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::SeqCst);

        #[cfg(unix)]
        // Writes to dead peers surface as errors, not process death.
        // SAFETY: installing SIG_IGN is async-signal-safe.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::transport(format!("multiplexer build failed: {e}")))?;
        let local = LocalSet::new();

        let this = self.clone();
        let outcome = local.block_on(&runtime, async move { this.main_loop().await });

        // Dropping the LocalSet and runtime cancels every watcher task; the
        // stale handles must not block re-arming on the next start.
        drop(local);
        drop(runtime);
        let mut inner = self.inner.borrow_mut();
        for entry in inner.events.values_mut() {
            entry.abort = None;
        }
        drop(inner);
        self.shared.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn main_loop(&self) -> Result<()> {
        // Arm watchers for everything registered before start.
        let ids: Vec<EventId> = self.inner.borrow().events.keys().copied().collect();
        for id in ids {
            let mut inner = self.inner.borrow_mut();
            let freeze_rx = inner.freeze_tx.subscribe();
            if let Some(entry) = inner.events.get_mut(&id) {
                if entry.abort.is_none() {
                    let handle = if entry.timer.is_some() {
                        self.spawn_timer(id, entry)
                    } else {
                        self.spawn_fd_watcher(id, entry, freeze_rx)
                    };
                    entry.abort = Some(handle);
                }
            }
        }
        self.spawn_signal_watchers();

        let easy = self.inner.borrow().easy;
        loop {
            let frequency = self.inner.borrow().frequency;
            tokio::select! {
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep(frequency) => {}
            }
            self.drain_queue();
            self.drain_local_jobs();
            if easy || self.shared.stopping.load(Ordering::SeqCst) {
                break;
            }
        }
        // Give already-scheduled callbacks their tick before teardown.
        tokio::task::yield_now().await;
        self.drain_queue();
        self.drain_local_jobs();
        debug!("dispatch loop finished");
        Ok(())
    }

    fn drain_local_jobs(&self) {
        loop {
            let jobs = std::mem::take(&mut self.inner.borrow_mut().local_jobs);
            if jobs.is_empty() {
                return;
            }
            for job in jobs {
                job();
            }
        }
    }

    fn drain_queue(&self) {
        let jobs: Vec<_> = std::mem::take(
            &mut *self
                .shared
                .queue
                .lock()
                .expect("dispatch queue lock poisoned"),
        );
        for job in jobs {
            job();
        }
    }

    fn spawn_fd_watcher(
        &self,
        id: EventId,
        entry: &Entry,
        mut freeze_rx: watch::Receiver<bool>,
    ) -> tokio::task::AbortHandle {
        let fd = entry.fd.unwrap_or(-1);
        let callback = Rc::clone(&entry.callback);
        let mut mask_rx = entry.mask_tx.subscribe();
        let this = self.clone();
        let handle = tokio::task::spawn_local(async move {
            struct Raw(std::os::fd::RawFd);
            impl std::os::fd::AsRawFd for Raw {
                fn as_raw_fd(&self) -> std::os::fd::RawFd {
                    self.0
                }
            }
            let afd = match AsyncFd::with_interest(
                Raw(fd),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                Ok(afd) => afd,
                Err(err) => {
                    warn!(id, fd, "fd registration failed: {err}");
                    (callback.borrow_mut())(id, Kind::Close);
                    this.del(id);
                    return;
                }
            };
            loop {
                let mask = *mask_rx.borrow();
                let frozen = *freeze_rx.borrow();
                let want_read = mask & MASK_READ != 0 && !frozen;
                let want_write = mask & MASK_WRITE != 0 && !frozen;
                let want_connect = mask & MASK_CONNECT != 0;
                if !(want_read || want_write || want_connect) {
                    tokio::select! {
                        changed = mask_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        changed = freeze_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                    continue;
                }
                tokio::select! {
                    biased;
                    changed = mask_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = freeze_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    guard = afd.readable(), if want_read => match guard {
                        Ok(mut guard) => {
                            guard.clear_ready();
                            (callback.borrow_mut())(id, Kind::Read);
                        }
                        Err(err) => {
                            warn!(id, fd, "read watch failed: {err}");
                            (callback.borrow_mut())(id, Kind::Close);
                            this.del(id);
                            return;
                        }
                    },
                    guard = afd.writable(), if want_write || want_connect => match guard {
                        Ok(mut guard) => {
                            guard.clear_ready();
                            if want_connect {
                                // Connect completion is one-shot.
                                let _ = this.mode(id, Kind::Connect, false);
                                (callback.borrow_mut())(id, Kind::Connect);
                            } else {
                                (callback.borrow_mut())(id, Kind::Write);
                            }
                        }
                        Err(err) => {
                            warn!(id, fd, "write watch failed: {err}");
                            (callback.borrow_mut())(id, Kind::Close);
                            this.del(id);
                            return;
                        }
                    },
                }
            }
        });
        handle.abort_handle()
    }

    fn spawn_timer(&self, id: EventId, entry: &Entry) -> tokio::task::AbortHandle {
        let spec = entry.timer.as_ref().map(|t| (t.delay, t.recurrent));
        let (delay, recurrent) = spec.unwrap_or((Duration::from_millis(0), false));
        let callback = Rc::clone(&entry.callback);
        let mut mask_rx = entry.mask_tx.subscribe();
        let this = self.clone();
        let handle = tokio::task::spawn_local(async move {
            loop {
                if *mask_rx.borrow() & MASK_TIMER == 0 {
                    if mask_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                tokio::select! {
                    biased;
                    changed = mask_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                (callback.borrow_mut())(id, Kind::Timer);
                if !recurrent {
                    // The callback may have re-registered the id; only the
                    // entry this task still owns is removed.
                    let own = this
                        .inner
                        .borrow()
                        .events
                        .get(&id)
                        .map(|entry| Rc::ptr_eq(&entry.callback, &callback))
                        .unwrap_or(false);
                    if own {
                        this.del(id);
                    }
                    return;
                }
            }
        });
        handle.abort_handle()
    }

    fn spawn_signal_watchers(&self) {
        let registrations: Vec<(SignalSet, SignalCallback)> = self
            .inner
            .borrow()
            .signals
            .iter()
            .map(|(set, callback)| (*set, Rc::clone(callback)))
            .collect();
        for (set, callback) in registrations {
            for signum in set.iter() {
                let callback = Rc::clone(&callback);
                match signals::stream(signum) {
                    Ok(mut stream) => {
                        tokio::task::spawn_local(async move {
                            while stream.recv().await.is_some() {
                                (callback.borrow_mut())(signum);
                            }
                        });
                    }
                    Err(err) => warn!(signum, "signal not interceptable: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn on_thread(test: impl FnOnce(Dispatch) + Send + 'static) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let dispatch = Dispatch::new();
            test(dispatch);
        })
    }

    #[test]
    fn timer_fires_at_or_after_its_deadline() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            let waker = dispatch.waker();
            let started = Instant::now();
            let tx_timer = tx.clone();
            dispatch
                .add_timer(
                    1,
                    Duration::from_millis(50),
                    false,
                    Rc::new(RefCell::new(move |_, kind| {
                        assert_eq!(kind, Kind::Timer);
                        tx_timer.send(started.elapsed()).unwrap();
                    })),
                )
                .unwrap();
            dispatch
                .add_timer(
                    2,
                    Duration::from_millis(150),
                    false,
                    Rc::new(RefCell::new(move |_, _| waker.stop())),
                )
                .unwrap();
            dispatch.start().unwrap();
        });
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(50), "fired at {elapsed:?}");
        handle.join().unwrap();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            let waker = dispatch.waker();
            let tx_victim = tx.clone();
            dispatch
                .add_timer(
                    10,
                    Duration::from_millis(50),
                    false,
                    Rc::new(RefCell::new(move |_, _| {
                        tx_victim.send("victim fired").unwrap();
                    })),
                )
                .unwrap();
            // At +10 ms another timer removes the 50 ms one.
            let cancel_target = dispatch.clone();
            dispatch
                .add_timer(
                    11,
                    Duration::from_millis(10),
                    false,
                    Rc::new(RefCell::new(move |_, _| cancel_target.del(10))),
                )
                .unwrap();
            dispatch
                .add_timer(
                    12,
                    Duration::from_millis(120),
                    false,
                    Rc::new(RefCell::new(move |_, _| waker.stop())),
                )
                .unwrap();
            dispatch.start().unwrap();
            // Entry is gone as well.
            assert!(dispatch.is_empty() || dispatch.len() <= 1);
            tx.send("done").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn recurrent_timer_repeats_until_removed() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            let waker = dispatch.waker();
            let count = Rc::new(RefCell::new(0u32));
            let count_in = Rc::clone(&count);
            let remover = dispatch.clone();
            let tx_count = tx.clone();
            dispatch
                .add_timer(
                    1,
                    Duration::from_millis(10),
                    true,
                    Rc::new(RefCell::new(move |id, _| {
                        let mut count = count_in.borrow_mut();
                        *count += 1;
                        if *count == 3 {
                            remover.del(id);
                            tx_count.send(*count).unwrap();
                            waker.stop();
                        }
                    })),
                )
                .unwrap();
            dispatch.start().unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn duplicate_event_ids_are_rejected() {
        let dispatch = Dispatch::new();
        let noop: Callback = Rc::new(RefCell::new(|_, _| {}));
        dispatch
            .add_timer(7, Duration::from_secs(1), false, Rc::clone(&noop))
            .unwrap();
        assert!(dispatch
            .add_timer(7, Duration::from_secs(1), false, noop)
            .is_err());
    }

    #[test]
    fn submitted_jobs_run_on_the_loop_thread() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            let waker = dispatch.waker();
            let outside = waker.clone();
            std::thread::spawn(move || {
                outside.submit(move || {
                    // Runs on the reactor thread during a tick.
                });
                outside.kick();
            });
            dispatch
                .add_timer(
                    1,
                    Duration::from_millis(60),
                    false,
                    Rc::new(RefCell::new(move |_, _| waker.stop())),
                )
                .unwrap();
            dispatch.start().unwrap();
            tx.send("stopped").unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "stopped");
        handle.join().unwrap();
    }

    #[test]
    fn fd_readiness_dispatches_read() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            use std::io::Write;
            use std::os::fd::AsRawFd;
            let (mut writer, reader) = std::os::unix::net::UnixStream::pair().unwrap();
            reader.set_nonblocking(true).unwrap();
            let fd = reader.as_raw_fd();

            let waker = dispatch.waker();
            let tx_read = tx.clone();
            dispatch
                .add_event(
                    1,
                    fd,
                    Rc::new(RefCell::new(move |_, kind| {
                        if kind == Kind::Read {
                            tx_read.send("readable").unwrap();
                            waker.stop();
                        }
                    })),
                )
                .unwrap();
            dispatch.mode(1, Kind::Read, true).unwrap();

            writer.write_all(b"x").unwrap();
            dispatch.start().unwrap();
            // Keep the pair alive until the loop saw the readiness.
            drop(reader);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "readable");
        handle.join().unwrap();
    }

    #[test]
    fn freeze_blocks_read_but_not_timers() {
        let (tx, rx) = mpsc::channel();
        let handle = on_thread(move |dispatch| {
            use std::io::Write;
            use std::os::fd::AsRawFd;
            let (mut writer, reader) = std::os::unix::net::UnixStream::pair().unwrap();
            reader.set_nonblocking(true).unwrap();
            let fd = reader.as_raw_fd();

            dispatch.freeze(true);
            let tx_read = tx.clone();
            dispatch
                .add_event(
                    1,
                    fd,
                    Rc::new(RefCell::new(move |_, kind| {
                        if kind == Kind::Read {
                            tx_read.send("read while frozen").unwrap();
                        }
                    })),
                )
                .unwrap();
            dispatch.mode(1, Kind::Read, true).unwrap();
            writer.write_all(b"x").unwrap();

            let waker = dispatch.waker();
            let tx_timer = tx.clone();
            dispatch
                .add_timer(
                    2,
                    Duration::from_millis(80),
                    false,
                    Rc::new(RefCell::new(move |_, _| {
                        tx_timer.send("timer ran").unwrap();
                        waker.stop();
                    })),
                )
                .unwrap();
            dispatch.start().unwrap();
            drop(reader);
        });
        // The timer message arrives; the frozen read never does.
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "timer ran");
        assert!(rx.try_recv().is_err());
        handle.join().unwrap();
    }

    #[test]
    fn rebase_preserves_registrations() {
        let dispatch = Dispatch::new();
        dispatch
            .add_timer(
                1,
                Duration::from_secs(10),
                false,
                Rc::new(RefCell::new(|_, _| {})),
            )
            .unwrap();
        dispatch.rebase().unwrap();
        assert_eq!(dispatch.len(), 1);
    }
}
