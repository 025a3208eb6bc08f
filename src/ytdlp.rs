use crate::config::Config;
use crate::engine::{Downloaded, MediaEngine};
use crate::error::{AppError, Result};
use crate::format::RawInfo;
use crate::profile::JobSpec;
use crate::progress::RawEvent;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, instrument, warn};
use yt_dlp::fetcher::deps::Libraries;
use yt_dlp::Youtube;

const PROGRESS_PREFIX: &str = "draxon|";
const FILE_PREFIX: &str = "draxon-file|";
const PROGRESS_TEMPLATE: &str = "download:draxon|%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";

/// A running yt-dlp process and whether [`MediaEngine::cancel`] killed it.
struct Running {
    child: Child,
    killed: bool,
}

/// [`MediaEngine`] backed by the yt-dlp command line program.
///
/// # Fields
/// * `yt_dlp` - Path to the yt-dlp executable
/// * `ffmpeg` - Path to ffmpeg, passed on for merging and audio extraction
/// * `running` - In-flight download processes, keyed by a per-call id
/// * `stopped` - Set by [`MediaEngine::cancel`]; no download starts afterwards
pub struct YtDlpEngine {
    yt_dlp: PathBuf,
    ffmpeg: Option<PathBuf>,
    running: Mutex<HashMap<u64, Running>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

impl YtDlpEngine {
    /// Uses binaries that are already installed.
    pub fn with_binaries(yt_dlp: impl Into<PathBuf>, ffmpeg: Option<PathBuf>) -> Self {
        Self {
            yt_dlp: yt_dlp.into(),
            ffmpeg,
            running: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Creates an engine from the configured libraries directory.
    ///
    /// # Details
    /// Checks for existing yt-dlp and ffmpeg binaries. If not found,
    /// downloads new ones. Otherwise, uses existing binaries and updates yt-dlp.
    #[instrument(skip(config))]
    pub async fn provision(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.libraries_dir).await?;
        let youtube = Self::initialize_youtube(&config.libraries_dir).await?;
        debug!(yt_dlp = ?youtube.libraries.youtube, "yt-dlp ready");
        Ok(Self::with_binaries(
            youtube.libraries.youtube.clone(),
            Some(youtube.libraries.ffmpeg.clone()),
        ))
    }

    async fn initialize_youtube(libraries_dir: &Path) -> Result<Youtube> {
        // Only the binaries are used; downloads go wherever each job's template points.
        let scratch = libraries_dir.join("scratch");
        if !libraries_dir.join("yt-dlp").exists() || !libraries_dir.join("ffmpeg").exists() {
            let youtube = Youtube::with_new_binaries(libraries_dir.to_path_buf(), scratch).await?;
            return Ok(youtube);
        }

        let yt_dlp = libraries_dir.join("yt-dlp");
        let ffmpeg = libraries_dir.join("ffmpeg");
        let libraries = Libraries::new(yt_dlp, ffmpeg);
        let youtube = Youtube::new(libraries, scratch)?;
        if let Err(e) = youtube.update_downloader().await {
            warn!("Could not update yt-dlp, continuing with the installed one: {}", e);
        }

        Ok(youtube)
    }

    /// Command line arguments for one job, URL last.
    pub fn download_args(&self, job: &JobSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--progress".into(),
            "--no-simulate".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            "--print".into(),
            format!("after_move:{}%(filepath)s", FILE_PREFIX),
            "-f".into(),
            job.format_selector.clone(),
            "-o".into(),
            job.output_template.clone(),
        ];
        args.push(if job.resume { "--continue" } else { "--no-continue" }.into());
        args.push(if job.playlist_allowed { "--yes-playlist" } else { "--no-playlist" }.into());
        if let Some(proxy) = &job.proxy {
            args.extend(["--proxy".into(), proxy.clone()]);
        }
        if let Some(rate) = job.rate_limit_bytes_per_sec {
            args.extend(["--limit-rate".into(), rate.to_string()]);
        }
        if !job.subtitle_langs.is_empty() {
            let langs: Vec<&str> = job.subtitle_langs.iter().map(String::as_str).collect();
            args.extend([
                "--write-subs".into(),
                "--sub-langs".into(),
                langs.join(","),
                "--convert-subs".into(),
                "srt".into(),
            ]);
        }
        if job.audio_extract {
            args.extend([
                "-x".into(),
                "--audio-format".into(),
                "mp3".into(),
                "--audio-quality".into(),
                "192K".into(),
            ]);
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            args.extend(["--ffmpeg-location".into(), ffmpeg.to_string_lossy().into_owned()]);
        }
        for (key, value) in &job.extra {
            let flag = if key.starts_with('-') {
                key.clone()
            } else {
                format!("--{}", key)
            };
            args.push(flag);
            if let Some(value) = value {
                args.push(value.clone());
            }
        }
        args.push("--".into());
        args.push(job.url.clone());
        args
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parses one line printed through the progress template.
pub fn parse_progress_line(line: &str) -> Option<RawEvent> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let fields: Vec<&str> = rest.split('|').collect();
    let [status, downloaded, total, estimate, speed, eta] = fields.as_slice() else {
        return None;
    };
    let number = |s: &str| s.trim().parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0);
    match *status {
        "downloading" => Some(RawEvent::Downloading {
            downloaded_bytes: number(*downloaded).map(|n| n as u64).unwrap_or(0),
            total_bytes: number(*total).or_else(|| number(*estimate)).map(|n| n as u64),
            speed_bytes_per_sec: number(*speed),
            eta_seconds: number(*eta).map(|n| n as u64),
        }),
        "finished" => Some(RawEvent::Finished),
        "error" => Some(RawEvent::Error {
            message: "engine reported a download error".into(),
        }),
        _ => None,
    }
}

/// Maps yt-dlp's stderr to the extraction error family.
fn classify_failure(stderr: &str) -> AppError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .unwrap_or(stderr.trim())
        .to_string();
    let lower = message.to_lowercase();
    if lower.contains("404")
        || lower.contains("not found")
        || lower.contains("unsupported url")
        || lower.contains("does not exist")
        || lower.contains("video unavailable")
    {
        AppError::NotFound(message)
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("unable to download")
        || lower.contains("connection")
        || lower.contains("name resolution")
    {
        AppError::Network(message)
    } else {
        AppError::Extraction(message)
    }
}

impl MediaEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    #[instrument(skip(self))]
    fn extract_info(&self, url: &str) -> Result<RawInfo> {
        let output = Command::new(&self.yt_dlp)
            .args(["--no-progress", "--dump-json", "--no-playlist", "--", url])
            .output()?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| AppError::Extraction(format!("no metadata returned for {}", url)))?;
        Ok(serde_json::from_str(first)?)
    }

    #[instrument(skip(self, job, on_progress), fields(url = %job.url))]
    fn download(&self, job: &JobSpec, on_progress: &mut dyn FnMut(RawEvent)) -> Result<Downloaded> {
        // Spawn and register under the same lock cancel() takes.
        let (id, stdout, mut stderr) = {
            let mut running = self.lock_running();
            if self.stopped.load(Ordering::SeqCst) {
                debug!("Not starting yt-dlp; engine was asked to stop");
                return Err(AppError::Cancelled);
            }
            let mut child = Command::new(&self.yt_dlp)
                .args(self.download_args(job))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                let _ = child.kill();
                let _ = child.wait();
                return Err("yt-dlp output was not captured".into());
            };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            running.insert(id, Running { child, killed: false });
            (id, stdout, stderr)
        };
        let stderr_reader = std::thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        });

        let mut path = None;
        let read = BufReader::new(stdout).lines().try_for_each(|line| {
            let line = line?;
            if let Some(file) = line.trim().strip_prefix(FILE_PREFIX) {
                path = Some(PathBuf::from(file));
            } else if let Some(event) = parse_progress_line(&line) {
                on_progress(event);
            }
            Ok::<(), std::io::Error>(())
        });

        let running = self.lock_running().remove(&id);
        let Some(mut running) = running else {
            return Err(AppError::Download("yt-dlp process record went missing".into()));
        };
        if read.is_err() {
            let _ = running.child.kill();
        }
        let status = running.child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        read?;
        if running.killed {
            return Err(AppError::Cancelled);
        }
        if !status.success() {
            let failure = classify_failure(&stderr);
            let message = failure.to_string();
            on_progress(RawEvent::Error {
                message: message.clone(),
            });
            return Err(AppError::Download(message));
        }
        Ok(Downloaded { path })
    }

    /// Kills every running download and refuses to start new ones.
    fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for (id, running) in self.lock_running().iter_mut() {
            if running.killed {
                continue;
            }
            match running.child.kill() {
                Ok(()) => {
                    running.killed = true;
                    debug!(process = id, "Stopped yt-dlp process");
                }
                Err(e) => warn!(process = id, "Could not stop yt-dlp process: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{OverrideToken, Profile, ProfileResolver};

    fn engine() -> YtDlpEngine {
        YtDlpEngine::with_binaries("yt-dlp", Some(PathBuf::from("/opt/ffmpeg")))
    }

    #[test]
    fn args_carry_every_job_setting() {
        let profile = Profile::new("p")
            .with("proxy", "socks5://127.0.0.1:9050")
            .with("rate_limit", "1M")
            .with("subtitles_languages", "en");
        let job = ProfileResolver::new(Profile::builtin(), profile).resolve(
            "https://a.example/v",
            &[
                OverrideToken::Audio(true),
                OverrideToken::Opaque {
                    key: "embed-thumbnail".into(),
                    value: None,
                },
            ],
        );
        let args = engine().download_args(&job);

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-f") + 1], "bestaudio/best");
        assert_eq!(args[pos("--proxy") + 1], "socks5://127.0.0.1:9050");
        assert_eq!(args[pos("--limit-rate") + 1], "1048576");
        assert_eq!(args[pos("--sub-langs") + 1], "en");
        assert_eq!(args[pos("--ffmpeg-location") + 1], "/opt/ffmpeg");
        assert!(args.contains(&"-x".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.contains(&"--embed-thumbnail".to_string()));
        assert_eq!(args.last().unwrap(), "https://a.example/v");
    }

    #[test]
    fn parses_progress_lines() {
        let event = parse_progress_line("draxon|downloading|1024|NA|4096|512.5|6").unwrap();
        assert_eq!(
            event,
            RawEvent::Downloading {
                downloaded_bytes: 1024,
                total_bytes: Some(4096),
                speed_bytes_per_sec: Some(512.5),
                eta_seconds: Some(6),
            }
        );
        assert_eq!(
            parse_progress_line("draxon|finished|4096|4096|NA|NA|NA"),
            Some(RawEvent::Finished)
        );
        assert_eq!(parse_progress_line("[download] 10% of 4MiB"), None);
        assert_eq!(parse_progress_line("draxon|downloading|1"), None);
    }

    #[test]
    fn classifies_stderr() {
        assert!(matches!(
            classify_failure("ERROR: [generic] Unsupported URL: https://x"),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("WARNING: retry\nERROR: Read timed out."),
            AppError::Network(_)
        ));
        assert!(matches!(
            classify_failure("ERROR: Sign in to confirm your age"),
            AppError::Extraction(_)
        ));
    }

    #[cfg(unix)]
    fn stub_engine(dir: &Path, body: &str) -> YtDlpEngine {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        YtDlpEngine::with_binaries(path, None)
    }

    #[cfg(unix)]
    #[test]
    fn download_forwards_progress_and_final_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = stub_engine(
            temp.path(),
            "echo 'draxon|downloading|10|100|NA|5.0|3'\n\
             echo 'draxon|finished|100|100|NA|NA|NA'\n\
             echo 'draxon-file|/tmp/clip.mp4'",
        );
        let mut events = Vec::new();
        let downloaded = engine
            .download(&JobSpec::for_url("https://a.example/v"), &mut |e| events.push(e))
            .unwrap();

        assert_eq!(downloaded.path, Some(PathBuf::from("/tmp/clip.mp4")));
        assert_eq!(
            events,
            vec![
                RawEvent::Downloading {
                    downloaded_bytes: 10,
                    total_bytes: Some(100),
                    speed_bytes_per_sec: Some(5.0),
                    eta_seconds: Some(3),
                },
                RawEvent::Finished,
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn failed_exit_becomes_download_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = stub_engine(
            temp.path(),
            "echo 'ERROR: [youtube] abc: Video unavailable' >&2\nexit 1",
        );
        let mut events = Vec::new();
        let err = engine
            .download(&JobSpec::for_url("https://a.example/v"), &mut |e| events.push(e))
            .unwrap_err();

        match err {
            AppError::Download(message) => assert!(message.contains("Video unavailable")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(events.last(), Some(RawEvent::Error { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_a_running_download() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = std::sync::Arc::new(stub_engine(temp.path(), "exec sleep 5"));
        let started = std::time::Instant::now();
        let worker = {
            let engine = std::sync::Arc::clone(&engine);
            std::thread::spawn(move || {
                let result = engine.download(&JobSpec::for_url("https://a.example/v"), &mut |_| {});
                matches!(result, Err(AppError::Cancelled))
            })
        };

        while engine.lock_running().is_empty() {
            assert!(started.elapsed() < std::time::Duration::from_secs(3));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        engine.cancel();

        assert!(worker.join().unwrap());
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn download_after_cancel_never_starts() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = stub_engine(temp.path(), "sleep 2");
        engine.cancel();

        let started = std::time::Instant::now();
        let result = engine.download(&JobSpec::for_url("https://a.example/v"), &mut |_| {});

        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert!(engine.lock_running().is_empty());
    }
}
