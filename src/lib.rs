/// A profile-driven media downloader built on yt-dlp.
///
/// This library turns `URL||overrides` tokens into fully resolved download
/// jobs and runs them through a bounded pool, with cooperative cancellation
/// and a push-based progress store.
///
/// # Architecture
///
/// The application is structured into several key components:
/// - `ConfigStore` / `ProfileResolver`: layered settings and named profiles
/// - `FormatCatalog`: ranking of the formats a URL offers
/// - `JobScheduler`: bounded, cancellable execution of download jobs
/// - `ProgressAggregator`: latest progress snapshot per task
/// - `MediaEngine` / `YtDlpEngine`: the external download engine
/// - `Manifest`: per-URL outcomes of a session
///
/// # Example
/// ```no_run
/// use draxon::{CancellationController, Config, ConfigStore, JobScheduler, YtDlpEngine};
/// use std::sync::Arc;
///
/// async fn example() -> draxon::error::Result<()> {
///     let config = Config::default();
///     let store = ConfigStore::load(&config.config_path);
///     let resolver = store.resolver(store.active_profile(None));
///     let jobs = resolver.resolve_tokens(&["https://www.youtube.com/watch?v=dQw4w9WgXcQ||audio"]);
///
///     let engine = Arc::new(YtDlpEngine::provision(&config).await?);
///     let scheduler = JobScheduler::new(engine, CancellationController::new());
///     let manifest = scheduler.run(jobs, resolver.concurrency()).await?;
///     println!("{} finished", manifest.finished());
///     Ok(())
/// }
/// ```
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod history;
pub mod input;
pub mod manifest;
pub mod profile;
pub mod progress;
pub mod scheduler;
pub mod task;
pub mod ytdlp;

// Re-export commonly used items
pub use cancel::CancellationController;
pub use config::{Config, ConfigStore};
pub use engine::{Downloaded, MediaEngine};
pub use error::AppError;
pub use format::{FormatCatalog, FormatDescriptor, FormatKind};
pub use history::History;
pub use manifest::{Manifest, TaskOutcome};
pub use profile::{JobSpec, OverrideToken, Profile, ProfileResolver};
pub use progress::{Phase, ProgressAggregator, ProgressSnapshot, RawEvent};
pub use scheduler::JobScheduler;
pub use task::{TaskHandle, TaskId, TaskState};
pub use ytdlp::YtDlpEngine;
