use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::sys::signal::{SigHandler, Signal};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{QueueError, QueueResult};

/// Signals that request a shutdown
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// Which shutdown request the supervisor received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Terminate,
    Interrupt,
    Quit,
}

impl ShutdownKind {
    /// OS signal carrying the same request
    pub fn signal(&self) -> Signal {
        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Interrupt => Signal::SIGINT,
            Self::Quit => Signal::SIGQUIT,
        }
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signal().as_str())
    }
}

/// Request delivered to a running supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Shutdown(ShutdownKind),
    Restart,
}

/// Sending half of the supervisor control channel
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl ControlHandle {
    /// Returns false if the supervisor is gone
    pub fn send(&self, control: Control) -> bool {
        self.tx.send(control).is_ok()
    }

    pub fn shutdown(&self, kind: ShutdownKind) -> bool {
        self.send(Control::Shutdown(kind))
    }

    pub fn restart(&self) -> bool {
        self.send(Control::Restart)
    }
}

pub type ControlReceiver = mpsc::UnboundedReceiver<Control>;

pub fn control_channel() -> (ControlHandle, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlHandle { tx }, rx)
}

/// Translate TERM, INT and QUIT into shutdown requests and HUP into restarts.
///
/// After the first shutdown request the listener stops and the shutdown
/// signals get their default action back, so a second TERM or INT during the
/// grace period ends the process instead of being swallowed.
pub fn forward_os_signals(handle: ControlHandle) -> QueueResult<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let control = tokio::select! {
                _ = term.recv() => Control::Shutdown(ShutdownKind::Terminate),
                _ = int.recv() => Control::Shutdown(ShutdownKind::Interrupt),
                _ = quit.recv() => Control::Shutdown(ShutdownKind::Quit),
                _ = hup.recv() => Control::Restart,
            };
            info!(?control, "received signal");

            let delivered = handle.send(control);
            if matches!(control, Control::Shutdown(_)) {
                if let Err(e) = restore_default_disposition(&SHUTDOWN_SIGNALS) {
                    warn!(error = %e, "failed to restore default signal handling");
                }
                break;
            }
            if !delivered {
                break;
            }
        }
    }))
}

/// Put `signals` back to their default action
pub fn restore_default_disposition(signals: &[Signal]) -> QueueResult<()> {
    for &signal in signals {
        // SAFETY: installs the default disposition, no handler code runs
        unsafe { nix::sys::signal::signal(signal, SigHandler::SigDfl) }
            .map_err(|e| QueueError::Internal(format!("resetting {}: {}", signal, e)))?;
    }
    Ok(())
}

/// Watches a file's modification time; an advance requests a pool restart
#[derive(Debug, Clone)]
pub struct RestartWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl RestartWatcher {
    /// Start watching; the current mtime (if any) is the baseline
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_seen = modified(&path);
        Self { path, last_seen }
    }

    /// True once per advance of the modification time
    pub fn poll(&mut self) -> bool {
        let current = modified(&self.path);
        let advanced = match (current, self.last_seen) {
            (Some(now), Some(seen)) => now > seen,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if advanced {
            debug!(path = %self.path.display(), "restart file changed");
            self.last_seen = current;
        }
        advanced
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
