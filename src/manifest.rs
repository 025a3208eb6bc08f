use crate::task::{TaskHandle, TaskId, TaskState};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

/// Session outcome reporting.
///
/// Every admitted job ends up here exactly once, whatever happened to it.

/// The terminal result of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub handle: TaskHandle,
    /// Human-readable reason, present for failures.
    pub reason: Option<String>,
    pub output: Option<PathBuf>,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn id(&self) -> TaskId {
        self.handle.id
    }

    pub fn state(&self) -> TaskState {
        self.handle.state
    }
}

/// Per-URL outcomes of a download session, in input order.
///
/// # Examples
///
/// ```
/// use draxon::Manifest;
///
/// let manifest = Manifest::new(Vec::new());
/// assert_eq!(manifest.failed(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct Manifest {
    pub outcomes: Vec<TaskOutcome>,
    pub started_at: Instant,
}

impl Manifest {
    pub fn new(outcomes: Vec<TaskOutcome>) -> Self {
        Self {
            outcomes,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn started(outcomes: Vec<TaskOutcome>, started_at: Instant) -> Self {
        Self {
            outcomes,
            started_at,
        }
    }

    fn count(&self, state: TaskState) -> usize {
        self.outcomes.iter().filter(|o| o.state() == state).count()
    }

    pub fn finished(&self) -> usize {
        self.count(TaskState::Finished)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::Failed)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskState::Cancelled)
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.id() == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state() == TaskState::Failed)
    }

    pub fn log_summary(&self) {
        info!(
            total = self.outcomes.len(),
            finished = self.finished(),
            failed = self.failed(),
            cancelled = self.cancelled(),
            "Download summary: total time {:.1}s",
            self.started_at.elapsed().as_secs_f64()
        );
        for outcome in self.failures() {
            info!(
                task = %outcome.id(),
                url = %outcome.handle.url,
                "Failed: {}",
                outcome.reason.as_deref().unwrap_or("unknown error")
            );
        }
    }

    /// Appends failed downloads to a report file.
    ///
    /// Creates or appends to `path` with details of each failed download
    pub fn export_failures(&self, path: &Path) -> std::io::Result<()> {
        if self.failed() == 0 {
            return Ok(());
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut writer = std::io::BufWriter::new(file);

        writeln!(
            writer,
            "\n=== Failed Downloads Report {} ===",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        for outcome in self.failures() {
            writeln!(writer, "URL: {}", outcome.handle.url)?;
            writeln!(
                writer,
                "Error: {}",
                outcome.reason.as_deref().unwrap_or("unknown error")
            )?;
            writeln!(writer, "---")?;
        }

        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outcome(id: usize, state: TaskState, reason: Option<&str>) -> TaskOutcome {
        let mut handle = TaskHandle::new(TaskId(id), format!("https://a.example/{}", id));
        handle.state = state;
        TaskOutcome {
            handle,
            reason: reason.map(str::to_string),
            output: None,
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn counts_by_state() {
        let manifest = Manifest::new(vec![
            outcome(1, TaskState::Finished, None),
            outcome(2, TaskState::Failed, Some("HTTP 403")),
            outcome(3, TaskState::Cancelled, None),
            outcome(4, TaskState::Finished, None),
        ]);
        assert_eq!(manifest.finished(), 2);
        assert_eq!(manifest.failed(), 1);
        assert_eq!(manifest.cancelled(), 1);
        assert_eq!(manifest.get(TaskId(2)).unwrap().reason.as_deref(), Some("HTTP 403"));
    }

    #[test]
    fn exports_only_when_something_failed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("failed.txt");

        Manifest::new(vec![outcome(1, TaskState::Finished, None)])
            .export_failures(&path)
            .unwrap();
        assert!(!path.exists());

        Manifest::new(vec![outcome(2, TaskState::Failed, Some("HTTP 403"))])
            .export_failures(&path)
            .unwrap();
        let report = std::fs::read_to_string(&path).unwrap();
        assert!(report.contains("URL: https://a.example/2"));
        assert!(report.contains("Error: HTTP 403"));
    }
}
