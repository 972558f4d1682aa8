//! Signal interception for the reactor.
//!
//! The interceptable set mirrors the process-fault and lifecycle signals the
//! framework cares about. Handlers only mark arrival; the observable
//! dispatch happens on the reactor thread at the next tick. SIGPIPE is not
//! part of the set — it is unconditionally ignored at loop start. The hard
//! faults (SIGFPE, SIGILL, SIGBUS, SIGSEGV) are requested best-effort; the
//! OS layer refuses them on most platforms and the reactor logs and
//! continues.

use crate::errors::{Error, Result};

/// Which signals to intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet {
    pub interrupt: bool,
    pub terminate: bool,
    pub hangup: bool,
    pub quit: bool,
    pub abort: bool,
    pub fpe: bool,
    pub ill: bool,
    pub bus: bool,
    pub segv: bool,
    /// SIGCHLD, watched by the cluster supervisor.
    pub child: bool,
}

impl Default for SignalSet {
    fn default() -> Self {
        Self::none()
    }
}

impl SignalSet {
    /// Nothing intercepted.
    pub fn none() -> Self {
        Self {
            interrupt: false,
            terminate: false,
            hangup: false,
            quit: false,
            abort: false,
            fpe: false,
            ill: false,
            bus: false,
            segv: false,
            child: false,
        }
    }

    /// The lifecycle signals (INT, TERM, HUP, QUIT).
    pub fn lifecycle() -> Self {
        Self {
            interrupt: true,
            terminate: true,
            hangup: true,
            quit: true,
            ..Self::none()
        }
    }

    /// Everything the framework knows about.
    pub fn all() -> Self {
        Self {
            interrupt: true,
            terminate: true,
            hangup: true,
            quit: true,
            abort: true,
            fpe: true,
            ill: true,
            bus: true,
            segv: true,
            ..Self::none()
        }
    }

    /// Only SIGCHLD (worker supervision).
    pub fn child_only() -> Self {
        Self {
            child: true,
            ..Self::none()
        }
    }

    /// Raw signal numbers selected by this set.
    #[cfg(unix)]
    pub fn iter(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let pairs = [
            (self.interrupt, libc::SIGINT),
            (self.terminate, libc::SIGTERM),
            (self.hangup, libc::SIGHUP),
            (self.quit, libc::SIGQUIT),
            (self.abort, libc::SIGABRT),
            (self.fpe, libc::SIGFPE),
            (self.ill, libc::SIGILL),
            (self.bus, libc::SIGBUS),
            (self.segv, libc::SIGSEGV),
            (self.child, libc::SIGCHLD),
        ];
        for (selected, signum) in pairs {
            if selected {
                out.push(signum);
            }
        }
        out
    }

    #[cfg(not(unix))]
    pub fn iter(&self) -> Vec<i32> {
        Vec::new()
    }
}

/// Opens a signal stream for one raw signal number.
#[cfg(unix)]
pub(crate) fn stream(signum: i32) -> Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::from_raw(signum))
        .map_err(|e| Error::transport(format!("signal({signum}) registration: {e}")))
}
