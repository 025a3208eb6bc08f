use crate::error::Result;
use crate::format::RawInfo;
use crate::profile::JobSpec;
use crate::progress::RawEvent;
use std::path::PathBuf;

/// What a successful engine download reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Downloaded {
    /// Final file on disk, when the engine reports it.
    pub path: Option<PathBuf>,
}

/// The external media extraction and download engine.
///
/// Both calls block the calling thread; the scheduler runs them on tokio's
/// blocking pool. Implementations must be shareable across tasks.
pub trait MediaEngine: Send + Sync {
    /// Name of the engine (for logging)
    fn name(&self) -> &'static str {
        "engine"
    }

    /// Resolves a URL to its metadata and format list without downloading.
    fn extract_info(&self, url: &str) -> Result<RawInfo>;

    /// Downloads one job, reporting progress through `on_progress` until it
    /// returns.
    fn download(&self, job: &JobSpec, on_progress: &mut dyn FnMut(RawEvent)) -> Result<Downloaded>;

    /// Asks in-flight downloads to stop. Best effort; a download that stops
    /// this way should return [`crate::AppError::Cancelled`].
    fn cancel(&self) {}
}
