//! Unix signal handling for the daemon.
//!
//! SIGTERM and SIGINT request shutdown, SIGHUP requests a configuration
//! reload. The handlers only store into static atomics; the cycle loop
//! picks the flags up between cycles through [`SignalHandler`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static PENDING_SHUTDOWN: AtomicBool = AtomicBool::new(false);
static PENDING_RELOAD: AtomicBool = AtomicBool::new(false);

/// Signal types that the daemon handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM or SIGINT.
    Shutdown,
    /// SIGHUP.
    Reload,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Shutdown => write!(f, "shutdown"),
            SignalKind::Reload => write!(f, "reload"),
        }
    }
}

/// Request flags shared between the handler and the cycle loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    reload_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Create a new signal state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Whether a reload has been requested; clears the flag.
    #[inline]
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Request a configuration reload.
    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Relaxed);
    }

    fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        info!(signal = %kind, "Signal received");
        match kind {
            SignalKind::Shutdown => self.request_shutdown(),
            SignalKind::Reload => self.request_reload(),
        }
    }

    /// Number of signals delivered to this state.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Handle polled by the cycle loop.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
    listening: bool,
}

impl SignalHandler {
    /// Install the process signal handlers.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be registered.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        register_unix_handlers()?;
        Ok(Self {
            state: Arc::new(SignalState::new()),
            listening: true,
        })
    }

    /// Handler that only sees manual requests.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
            listening: false,
        }
    }

    fn drain_pending(&self) {
        if !self.listening {
            return;
        }
        if PENDING_SHUTDOWN.swap(false, Ordering::Relaxed) {
            self.state.record(SignalKind::Shutdown);
        }
        if PENDING_RELOAD.swap(false, Ordering::Relaxed) {
            self.state.record(SignalKind::Reload);
        }
    }

    /// Whether shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        self.drain_pending();
        self.state.shutdown_requested()
    }

    /// Whether a reload has been requested; clears the flag.
    pub fn take_reload_request(&self) -> bool {
        self.drain_pending();
        self.state.take_reload_request()
    }

    /// Manually request shutdown.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.state.request_shutdown();
    }

    /// Signal state for inspection.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_shutdown(_: c_int) {
        PENDING_SHUTDOWN.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_reload(_: c_int) {
        PENDING_RELOAD.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
        (libc::SIGTERM, on_shutdown),
        (libc::SIGINT, on_shutdown),
        (libc::SIGHUP, on_reload),
    ];
    for (signal, handler) in handlers {
        // SAFETY: the handlers only touch atomics, which is async-signal-safe
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Unix signal handlers registered");
    Ok(())
}
