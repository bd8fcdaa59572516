use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::{QueueError, QueueResult};

/// Check whether a process with `pid` exists
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to another user
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Marker file holding the process id of the running supervisor
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the marker; `None` when it is missing or unreadable
    pub fn read(&self) -> QueueResult<Option<i32>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pid of the live process the marker points at, if any
    pub fn live_pid(&self) -> QueueResult<Option<i32>> {
        Ok(self.read()?.filter(|pid| is_alive(*pid)))
    }

    /// Claim the marker for the current process.
    ///
    /// Fails with `AlreadyRunning` when it names another live process. A stale
    /// marker is removed first.
    pub fn acquire(&self) -> QueueResult<()> {
        let own = own_pid();

        if self.path.exists() {
            match self.read()? {
                Some(pid) if pid != own && is_alive(pid) => return Err(QueueError::AlreadyRunning { pid }),
                stale => {
                    info!(path = %self.path.display(), pid = ?stale, "Deleting stale pid file");
                    self.remove()?;
                }
            }
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            // Lost a race with another starting supervisor
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let pid = self.read()?.unwrap_or_default();
                return Err(QueueError::AlreadyRunning { pid });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", own)?;
        debug!(path = %self.path.display(), pid = own, "wrote pid file");
        Ok(())
    }

    /// Remove the marker if it still names the current process
    pub fn release(&self) -> QueueResult<()> {
        if self.read()? == Some(own_pid()) {
            self.remove()?;
        }
        Ok(())
    }

    /// Remove the marker unconditionally; a missing marker is not an error
    pub fn remove(&self) -> QueueResult<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn own_pid() -> i32 {
    i32::try_from(std::process::id()).unwrap_or(i32::MAX)
}
