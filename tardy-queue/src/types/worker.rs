use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SlotId;

/// One entry of a worker's queue preference list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueFilter {
    /// Exact queue name match
    Named(String),

    /// Any queue, including unqueued jobs
    Any,
}

impl QueueFilter {
    /// Check whether a job's queue passes this filter
    pub fn matches(&self, queue: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Named(name) => queue == Some(name.as_str()),
        }
    }
}

impl FromStr for QueueFilter {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "*" => Ok(Self::Any),
            name => Ok(Self::Named(name.to_string())),
        }
    }
}

impl fmt::Display for QueueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Inclusive priority window; either bound may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    pub min: Option<i32>,
    pub max: Option<i32>,
}

impl PriorityRange {
    pub fn new(min: Option<i32>, max: Option<i32>) -> Self {
        Self { min, max }
    }

    /// Check whether a priority lies inside the window
    pub fn contains(&self, priority: i32) -> bool {
        self.min.map_or(true, |min| priority >= min) && self.max.map_or(true, |max| priority <= max)
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Ephemeral worker identity used for reservation and lock ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Unique name: host, process id and slot id
    pub name: String,

    /// Ordered queue preference list; empty means a single implicit wildcard
    pub queues: Vec<QueueFilter>,

    /// Optional priority window
    pub priority_range: PriorityRange,
}

impl WorkerIdentity {
    /// Create a worker identity with an explicit name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: Vec::new(),
            priority_range: PriorityRange::default(),
        }
    }

    /// Identity scoped to one supervisor slot of the current process
    pub fn for_slot(slot: SlotId) -> Self {
        Self::new(Self::slot_name(slot))
    }

    /// `host:<hostname> pid:<pid> worker:<slot>`
    pub fn slot_name(slot: SlotId) -> String {
        let host = gethostname::gethostname().into_string().unwrap_or_else(|_| "unknown".to_string());
        format!("host:{} pid:{} worker:{}", host, std::process::id(), slot)
    }

    /// Set the queue preference list
    pub fn with_queues(mut self, queues: Vec<QueueFilter>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the priority window
    pub fn with_priority_range(mut self, range: PriorityRange) -> Self {
        self.priority_range = range;
        self
    }

    /// Preference entries in order, with the empty list treated as a single wildcard
    pub fn preference_entries(&self) -> Vec<QueueFilter> {
        if self.queues.is_empty() {
            vec![QueueFilter::Any]
        } else {
            self.queues.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_parses_as_wildcard() {
        assert_eq!("*".parse::<QueueFilter>().unwrap(), QueueFilter::Any);
        assert_eq!("mail".parse::<QueueFilter>().unwrap(), QueueFilter::Named("mail".into()));
    }

    #[test]
    fn wildcard_matches_unqueued() {
        assert!(QueueFilter::Any.matches(None));
        assert!(!QueueFilter::Named("q".into()).matches(None));
        assert!(QueueFilter::Named("q".into()).matches(Some("q")));
    }

    #[test]
    fn empty_preferences_become_wildcard() {
        let worker = WorkerIdentity::new("w");
        assert_eq!(worker.preference_entries(), vec![QueueFilter::Any]);
    }

    #[test]
    fn priority_range_is_inclusive() {
        let range = PriorityRange::new(Some(1), Some(3));
        assert!(range.contains(1));
        assert!(range.contains(3));
        assert!(!range.contains(0));
        assert!(!range.contains(4));
        assert!(PriorityRange::default().contains(i32::MIN));
    }

    #[test]
    fn slot_name_carries_pid_and_slot() {
        let name = WorkerIdentity::slot_name(SlotId(3));
        assert!(name.starts_with("host:"));
        assert!(name.contains(&format!("pid:{}", std::process::id())));
        assert!(name.ends_with("worker:3"));
    }
}
