//! Worker pool supervisor.
//!
//! One control loop owns every slot. Idle slots claim jobs through the
//! reservation protocol and hand them to an execution unit; a monitor task per
//! unit reports its exit back to the loop. Shutdown and restart requests arrive
//! on a [`ControlReceiver`], so OS signals stay an outer adapter.

pub mod control;
pub mod pidfile;
pub mod slot;
pub mod unit;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use control::{control_channel, forward_os_signals, Control, ControlHandle, ControlReceiver, RestartWatcher, ShutdownKind};
pub use pidfile::PidFile;
pub use slot::{CrashTracker, Slot, SlotState};
pub use unit::{ExecutionUnit, ProcessSpawner, Spawner, TaskSpawner, UnitControl, UnitExit};

use crate::{
    backend::JobStore,
    config::{SupervisorConfig, WorkerConfig},
    reservation::reserve,
    types::SlotId,
    QueueResult,
};

/// Longest the loop sleeps while a restart file is being watched
const RESTART_POLL: Duration = Duration::from_secs(1);

/// Why the supervisor returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// A shutdown request was handled; every unit has exited
    Shutdown(ShutdownKind),
    /// Every control handle was dropped
    ControlClosed,
}

type ExitReport = (SlotId, UnitExit);

struct Busy {
    control: Arc<dyn UnitControl>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    worker_config: WorkerConfig,
    store: Arc<dyn JobStore>,
    spawner: Arc<dyn Spawner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        worker_config: WorkerConfig,
        store: Arc<dyn JobStore>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            config,
            worker_config,
            store,
            spawner,
        }
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(self.config.pid_file())
    }

    /// Claim the pid marker and run the pool until a shutdown request.
    ///
    /// Fails with `AlreadyRunning` if another live supervisor owns the marker.
    /// The marker is removed on every exit path once it was acquired.
    pub async fn run(self, control: ControlReceiver) -> QueueResult<SupervisorExit> {
        let pid_file = self.pid_file();
        pid_file.acquire()?;

        let span = info_span!("supervisor", pid = std::process::id());
        let result = self.run_pool(control).instrument(span).await;

        if let Err(e) = pid_file.release() {
            warn!(error = %e, "failed to remove pid file");
        }
        result
    }

    async fn run_pool(&self, mut control: ControlReceiver) -> QueueResult<SupervisorExit> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitReport>();
        let started = Instant::now();
        let mut slots: Vec<Slot> = (0..self.config.workers.max(1))
            .map(|i| {
                Slot::new(
                    SlotId(i),
                    CrashTracker::new(self.config.crash_threshold, self.config.crash_window),
                    started,
                )
            })
            .collect();
        let mut busy: HashMap<SlotId, Busy> = HashMap::new();
        let mut watcher = self.config.restart_file.as_ref().map(RestartWatcher::new);

        info!(workers = slots.len(), isolation = ?self.config.isolation, "Starting job worker pool");

        loop {
            for slot in slots.iter_mut() {
                if slot.is_ready(Instant::now()) {
                    self.fill_slot(slot, &mut busy, &exit_tx).await;
                }
            }

            if watcher.as_mut().is_some_and(RestartWatcher::poll) {
                info!("restart file touched, restarting units");
                terminate_all(&busy, ShutdownKind::Terminate);
            }

            let mut wake = slots
                .iter()
                .filter(|s| s.is_idle())
                .map(|s| s.next_attempt_at)
                .min()
                .unwrap_or_else(|| Instant::now() + self.config.poll_interval);
            if watcher.is_some() {
                wake = wake.min(Instant::now() + RESTART_POLL);
            }

            tokio::select! {
                Some((slot_id, exit)) = exit_rx.recv() => {
                    busy.remove(&slot_id);
                    if let Some(slot) = slots.get_mut(slot_id.0) {
                        self.reap(slot, exit);
                    }
                }
                request = control.recv() => match request {
                    Some(Control::Shutdown(kind)) => {
                        self.shutdown(kind, &mut busy, &mut exit_rx).await;
                        return Ok(SupervisorExit::Shutdown(kind));
                    }
                    Some(Control::Restart) => {
                        info!(units = busy.len(), "restart requested");
                        terminate_all(&busy, ShutdownKind::Terminate);
                    }
                    None => {
                        self.shutdown(ShutdownKind::Terminate, &mut busy, &mut exit_rx).await;
                        return Ok(SupervisorExit::ControlClosed);
                    }
                },
                _ = sleep_until(wake) => {}
            }
        }
    }

    /// Claim a job for an idle slot and start a unit for it
    async fn fill_slot(&self, slot: &mut Slot, busy: &mut HashMap<SlotId, Busy>, exit_tx: &mpsc::UnboundedSender<ExitReport>) {
        let identity = self.worker_config.identity_for_slot(slot.id);
        let retry_at = Instant::now() + self.config.poll_interval;

        let job = match reserve(self.store.as_ref(), &identity, self.worker_config.max_run_time).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                slot.defer(retry_at);
                return;
            }
            Err(e) => {
                error!(slot = %slot.id, error = %e, "reservation failed");
                slot.defer(retry_at);
                return;
            }
        };

        let job_id = job.id;
        match self.spawner.spawn(job, identity.clone()) {
            Ok(mut unit) => {
                let control = unit.control();
                debug!(slot = %slot.id, job_id = %job_id, unit = %control.describe(), "spawned unit");

                let slot_id = slot.id;
                let exit_tx = exit_tx.clone();
                tokio::spawn(async move {
                    let exit = unit.wait().await;
                    let _ = exit_tx.send((slot_id, exit));
                });

                slot.mark_busy(job_id);
                busy.insert(slot.id, Busy { control });
            }
            Err(e) => {
                error!(slot = %slot.id, job_id = %job_id, error = %e, "failed to spawn unit");
                if let Err(e) = self.store.clear_locks(&identity.name).await {
                    error!(slot = %slot.id, error = %e, "failed to clear locks after spawn failure");
                }
                slot.defer(retry_at);
            }
        }
    }

    /// Return a slot to idle after its unit ended, holding it back when it crash-loops
    fn reap(&self, slot: &mut Slot, exit: UnitExit) {
        let now = Instant::now();
        debug!(slot = %slot.id, ?exit, "unit exited");
        slot.mark_idle(now);

        if exit.is_abnormal() && slot.crashes.record(now) {
            warn!(
                slot = %slot.id,
                deaths = slot.crashes.recent(),
                delay_secs = self.config.crash_delay.as_secs(),
                "worker slot is crash looping, delaying next claim"
            );
            slot.crashes.reset();
            slot.defer(now + self.config.crash_delay);
        }
    }

    /// Forward the shutdown to every unit, wait out the grace period, then kill the rest
    async fn shutdown(&self, kind: ShutdownKind, busy: &mut HashMap<SlotId, Busy>, exit_rx: &mut mpsc::UnboundedReceiver<ExitReport>) {
        info!(signal = %kind, units = busy.len(), "shutting down worker pool");
        terminate_all(busy, kind);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !busy.is_empty() {
            match timeout_at(deadline, exit_rx.recv()).await {
                Ok(Some((slot_id, _))) => {
                    busy.remove(&slot_id);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(units = busy.len(), "units still running after grace period, killing");
                    for unit in busy.values() {
                        unit.control.kill();
                    }
                    while !busy.is_empty() {
                        match exit_rx.recv().await {
                            Some((slot_id, _)) => {
                                busy.remove(&slot_id);
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        info!("worker pool stopped");
    }
}

fn terminate_all(busy: &HashMap<SlotId, Busy>, kind: ShutdownKind) {
    for unit in busy.values() {
        unit.control.terminate(kind);
    }
}
