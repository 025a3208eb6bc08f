use crate::cancel::CancellationController;
use crate::engine::MediaEngine;
use crate::error::{AppError, Result};
use crate::format::FormatCatalog;
use crate::manifest::{Manifest, TaskOutcome};
use crate::profile::JobSpec;
use crate::progress::{Phase, ProgressAggregator, RawEvent};
use crate::task::{TaskHandle, TaskId, TaskState};
use futures::stream::{self, StreamExt};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

/// Runs download jobs against the engine under a concurrency bound.
///
/// # Fields
/// * `engine` - The external engine every task calls into
/// * `progress` - Snapshot store fed by each task's progress callback
/// * `cancel` - Session stop flag checked before each admission
/// * `handles` - Task records; only the scheduler writes them
/// * `active_downloads` - Counter for currently running engine calls
/// * `outcomes` - Optional channel receiving each outcome as it settles
pub struct JobScheduler {
    engine: Arc<dyn MediaEngine>,
    progress: Arc<ProgressAggregator>,
    cancel: CancellationController,
    handles: Arc<RwLock<BTreeMap<TaskId, TaskHandle>>>,
    active_downloads: Arc<AtomicUsize>,
    outcomes: Option<mpsc::UnboundedSender<TaskOutcome>>,
}

impl JobScheduler {
    pub fn new(engine: Arc<dyn MediaEngine>, cancel: CancellationController) -> Self {
        Self {
            engine,
            progress: Arc::new(ProgressAggregator::new()),
            cancel,
            handles: Arc::new(RwLock::new(BTreeMap::new())),
            active_downloads: Arc::new(AtomicUsize::new(0)),
            outcomes: None,
        }
    }

    /// Streams every outcome to `tx` as soon as its task settles.
    pub fn with_outcome_sender(mut self, tx: mpsc::UnboundedSender<TaskOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn progress(&self) -> Arc<ProgressAggregator> {
        Arc::clone(&self.progress)
    }

    pub fn cancellation(&self) -> &CancellationController {
        &self.cancel
    }

    /// A consistent copy of every task handle, ordered by id.
    pub fn handles(&self) -> Vec<TaskHandle> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.values().cloned().collect()
    }

    pub fn active_downloads(&self) -> usize {
        self.active_downloads.load(Ordering::SeqCst)
    }

    /// Asks the engine for a URL's formats and ranks them.
    pub async fn catalog(&self, url: &str) -> Result<FormatCatalog> {
        let engine = Arc::clone(&self.engine);
        let url = url.to_string();
        let info = tokio::task::spawn_blocking(move || engine.extract_info(&url)).await??;
        Ok(FormatCatalog::from_info(&info))
    }

    /// Applies a state transition, rejecting anything but
    /// Pending -> Running -> terminal (or Pending -> Cancelled).
    fn transition(&self, id: TaskId, next: TaskState) -> Option<TaskHandle> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let handle = handles.get_mut(&id)?;
        if !handle.state.can_become(next) {
            warn!(task = %id, from = %handle.state, to = %next, "Rejected task state transition");
            return None;
        }
        handle.state = next;
        Some(handle.clone())
    }

    fn settle(
        &self,
        id: TaskId,
        state: TaskState,
        reason: Option<String>,
        output: Option<std::path::PathBuf>,
        elapsed: Duration,
    ) -> TaskOutcome {
        let phase = match state {
            TaskState::Finished => Phase::Done,
            TaskState::Failed => Phase::Error,
            _ => Phase::Cancelled,
        };
        self.progress.settle(id, phase);
        let handle = self.transition(id, state).unwrap_or_else(|| {
            let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
            handles
                .get(&id)
                .cloned()
                .unwrap_or_else(|| TaskHandle::new(id, String::new()))
        });
        let outcome = TaskOutcome {
            handle,
            reason,
            output,
            elapsed,
        };
        if let Some(tx) = &self.outcomes {
            let _ = tx.send(outcome.clone());
        }
        outcome
    }

    /// Runs one admitted task to a terminal state.
    ///
    /// # Details
    /// * Waits for a pool slot, then re-checks the stop flag
    /// * Runs the blocking engine call on tokio's blocking pool
    /// * Captures engine errors on the task instead of propagating them
    async fn run_task(&self, id: TaskId, job: JobSpec, semaphore: &Semaphore) -> TaskOutcome {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.settle(id, TaskState::Cancelled, None, None, Duration::ZERO);
            }
        };
        if self.cancel.is_stop_requested() {
            debug!(task = %id, url = %job.url, "Not starting task; stop requested");
            return self.settle(id, TaskState::Cancelled, None, None, Duration::ZERO);
        }
        if self.transition(id, TaskState::Running).is_none() {
            return self.settle(
                id,
                TaskState::Cancelled,
                Some("task could not start".into()),
                None,
                Duration::ZERO,
            );
        }

        let _active = DownloadGuard::new(&self.active_downloads);
        info!(task = %id, url = %job.url, "Starting download");
        let start = Instant::now();

        let engine = Arc::clone(&self.engine);
        let progress = Arc::clone(&self.progress);
        let cancel = self.cancel.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut reported_error = None;
            let mut on_progress = |event: RawEvent| {
                if cancel.is_stop_requested() && event.is_in_progress() {
                    return;
                }
                if let RawEvent::Error { message } = &event {
                    reported_error = Some(message.clone());
                }
                progress.ingest(id, event);
            };
            let result = engine.download(&job, &mut on_progress);
            (result, reported_error)
        })
        .await;
        let (result, reported_error) = match joined {
            Ok(pair) => pair,
            Err(e) => (Err(AppError::from(e)), None),
        };
        let elapsed = start.elapsed();

        match (result, reported_error) {
            // An error event outranks a clean return, keeping handle and snapshot in step.
            (Ok(_), Some(message)) => {
                warn!(task = %id, "Engine returned after reporting an error: {}", message);
                self.settle(id, TaskState::Failed, Some(message), None, elapsed)
            }
            (Ok(downloaded), None) => {
                info!(task = %id, "Download completed in {:.1}s", elapsed.as_secs_f64());
                self.settle(id, TaskState::Finished, None, downloaded.path, elapsed)
            }
            (Err(AppError::Cancelled), _) => {
                info!(task = %id, "Download stopped");
                self.settle(id, TaskState::Cancelled, None, None, elapsed)
            }
            (Err(e), _) => {
                let reason = e.to_string();
                error!(task = %id, "Failed to download: {}", reason);
                self.settle(id, TaskState::Failed, Some(reason), None, elapsed)
            }
        }
    }

    /// Runs every job and returns once each has reached a terminal state.
    ///
    /// # Arguments
    /// * `jobs` - Resolved jobs, admitted in this order
    /// * `concurrency_limit` - Maximum number of simultaneous engine calls; 0 is treated as 1
    ///
    /// # Errors
    /// * `AppError::Precondition` if a job has no URL; nothing is started in that case
    ///
    /// # Details
    /// * A failing task never aborts its siblings
    /// * After a stop request no further task starts, running ones are asked
    ///   to stop through the engine, and the rest are marked cancelled
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub async fn run(&self, jobs: Vec<JobSpec>, concurrency_limit: usize) -> Result<Manifest> {
        if let Some(pos) = jobs.iter().position(|j| j.url.trim().is_empty()) {
            return Err(AppError::Precondition(format!(
                "job {} has no URL",
                pos + 1
            )));
        }

        let limit = concurrency_limit.max(1);
        let total = jobs.len();
        let started_at = Instant::now();
        info!("Found {} jobs to download ({} at a time)", total, limit);

        let tasks: Vec<(TaskId, JobSpec)> = {
            let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
            let first = handles.keys().next_back().map(|id| id.0).unwrap_or(0) + 1;
            jobs.into_iter()
                .enumerate()
                .map(|(index, job)| {
                    let id = TaskId(first + index);
                    handles.insert(id, TaskHandle::new(id, job.url.clone()));
                    self.progress.register(id, job.declares_postprocessing());
                    (id, job)
                })
                .collect()
        };

        let watcher = {
            let cancel = self.cancel.clone();
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                cancel.stopped().await;
                info!("Asking {} to stop running downloads", engine.name());
                engine.cancel();
            })
        };

        let semaphore = Semaphore::new(limit);
        let completed = AtomicUsize::new(0);
        let mut outcomes: Vec<TaskOutcome> = stream::iter(tasks)
            .map(|(id, job)| {
                let semaphore = &semaphore;
                let completed = &completed;
                async move {
                    let outcome = self.run_task(id, job, semaphore).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        "Progress: {}/{} tasks settled ({:.1}%)",
                        done,
                        total,
                        done as f64 / total as f64 * 100.0
                    );
                    outcome
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        watcher.abort();
        let _ = watcher.await;

        outcomes.sort_by_key(|o| o.id());
        let manifest = Manifest::started(outcomes, started_at);
        manifest.log_summary();
        Ok(manifest)
    }
}

/// RAII guard for tracking active downloads
///
/// Automatically increments counter on creation and
/// decrements it when dropped
struct DownloadGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> DownloadGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl<'a> Drop for DownloadGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
