use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::SlotId;
use crate::JobId;

/// Rolling count of abnormal unit exits for one slot
#[derive(Debug, Clone)]
pub struct CrashTracker {
    threshold: usize,
    window: Duration,
    deaths: VecDeque<Instant>,
}

impl CrashTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            deaths: VecDeque::new(),
        }
    }

    /// Record an abnormal exit at `now`; true once more than `threshold` fall inside the window
    pub fn record(&mut self, now: Instant) -> bool {
        self.deaths.push_back(now);
        while let Some(oldest) = self.deaths.front() {
            if now.duration_since(*oldest) > self.window {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
        self.deaths.len() > self.threshold
    }

    pub fn reset(&mut self) {
        self.deaths.clear();
    }

    pub fn recent(&self) -> usize {
        self.deaths.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy { job_id: JobId },
}

/// One unit of pool concurrency
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub state: SlotState,
    /// An idle slot does not claim before this instant
    pub next_attempt_at: Instant,
    pub crashes: CrashTracker,
}

impl Slot {
    /// Idle slot, ready to claim from `ready_at`
    pub fn new(id: SlotId, crashes: CrashTracker, ready_at: Instant) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            next_attempt_at: ready_at,
            crashes,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    /// Idle and past its next attempt time
    pub fn is_ready(&self, now: Instant) -> bool {
        self.is_idle() && self.next_attempt_at <= now
    }

    pub fn mark_busy(&mut self, job_id: JobId) {
        self.state = SlotState::Busy { job_id };
    }

    /// Return to idle, claimable right away
    pub fn mark_idle(&mut self, now: Instant) {
        self.state = SlotState::Idle;
        self.next_attempt_at = now;
    }

    pub fn defer(&mut self, until: Instant) {
        self.next_attempt_at = until;
    }
}
