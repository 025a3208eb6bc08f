use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::trace;

/// Per-task progress tracking.
///
/// The engine reports progress through callbacks on whichever thread runs
/// the download; consumers poll snapshots at their own cadence. Every update
/// replaces a task's snapshot as a whole under one lock, so a reader never
/// sees fields from two different updates.

/// A progress callback payload from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawEvent {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed_bytes_per_sec: Option<f64>,
        eta_seconds: Option<u64>,
    },
    /// All bytes fetched; post-processing may still follow.
    Finished,
    Error {
        message: String,
    },
}

impl RawEvent {
    /// In-progress events may be coalesced or dropped; the others may not.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, RawEvent::Downloading { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Downloading,
    Postprocessing,
    Done,
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Cancelled)
    }
}

/// Latest known progress for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub phase: Phase,
}

impl ProgressSnapshot {
    fn empty(task_id: TaskId, phase: Phase) -> Self {
        Self {
            task_id,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bytes_per_sec: None,
            eta_seconds: None,
            phase,
        }
    }

    /// Completion in percent, when the total is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    snapshots: HashMap<TaskId, ProgressSnapshot>,
    postprocess: HashMap<TaskId, bool>,
}

/// Thread-safe store of the latest snapshot per task.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    state: RwLock<State>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares whether a task runs a post-processing step after fetching.
    pub fn register(&self, task_id: TaskId, postprocess: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.postprocess.insert(task_id, postprocess);
    }

    /// Applies one engine event. Events after a terminal phase are ignored.
    pub fn ingest(&self, task_id: TaskId, event: RawEvent) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let postprocess = state.postprocess.get(&task_id).copied().unwrap_or(false);
        let previous = state.snapshots.get(&task_id);
        if previous.is_some_and(|s| s.phase.is_terminal()) {
            trace!(task = %task_id, ?event, "Ignoring event after terminal phase");
            return;
        }

        let next = match event {
            RawEvent::Downloading {
                downloaded_bytes,
                total_bytes,
                speed_bytes_per_sec,
                eta_seconds,
            } => ProgressSnapshot {
                task_id,
                downloaded_bytes,
                total_bytes: total_bytes.or_else(|| previous.and_then(|s| s.total_bytes)),
                speed_bytes_per_sec,
                eta_seconds,
                phase: Phase::Downloading,
            },
            RawEvent::Finished => {
                let mut next = previous
                    .cloned()
                    .unwrap_or_else(|| ProgressSnapshot::empty(task_id, Phase::Done));
                if let Some(total) = next.total_bytes {
                    next.downloaded_bytes = next.downloaded_bytes.max(total);
                }
                next.speed_bytes_per_sec = None;
                next.eta_seconds = Some(0);
                next.phase = if postprocess {
                    Phase::Postprocessing
                } else {
                    Phase::Done
                };
                next
            }
            RawEvent::Error { .. } => {
                let mut next = previous
                    .cloned()
                    .unwrap_or_else(|| ProgressSnapshot::empty(task_id, Phase::Error));
                next.speed_bytes_per_sec = None;
                next.eta_seconds = None;
                next.phase = Phase::Error;
                next
            }
        };
        state.snapshots.insert(task_id, next);
    }

    /// Settles a task into a terminal phase unless it already has one.
    pub fn settle(&self, task_id: TaskId, phase: Phase) {
        debug_assert!(phase.is_terminal());
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = match state.snapshots.get(&task_id) {
            Some(s) if s.phase.is_terminal() => return,
            Some(s) => s.clone(),
            None => ProgressSnapshot::empty(task_id, phase),
        };
        if phase == Phase::Done {
            if let Some(total) = next.total_bytes {
                next.downloaded_bytes = next.downloaded_bytes.max(total);
            }
        }
        next.speed_bytes_per_sec = None;
        next.eta_seconds = None;
        next.phase = phase;
        state.snapshots.insert(task_id, next);
    }

    pub fn snapshot(&self, task_id: TaskId) -> Option<ProgressSnapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.snapshots.get(&task_id).cloned()
    }

    pub fn all_snapshots(&self) -> BTreeMap<TaskId, ProgressSnapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .snapshots
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }
}
