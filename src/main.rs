use clap::Parser;
use draxon::error::{AppError, Result};
use draxon::format::format_filesize;
use draxon::input::{normalize_tokens, read_piped_stdin, read_tokens, tokens_from_text};
use draxon::profile::{keys, parse_url_spec};
use draxon::{
    CancellationController, Config, ConfigStore, History, JobScheduler, Phase, Profile,
    ProgressAggregator, YtDlpEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};

#[derive(Parser, Clone)]
#[command(name = "draxon", version, about = "Download media with yt-dlp using named profiles")]
pub struct Cli {
    /// URLs to download, optionally followed by `||audio,rate=1M,...`
    pub urls: Vec<String>,

    /// Text file to pull URLs from
    #[arg(long, short)]
    pub file: Option<PathBuf>,

    #[arg(long, short)]
    pub profile: Option<String>,

    #[arg(long = "output-dir", short)]
    pub output_dir: Option<String>,

    #[arg(long)]
    pub outtmpl: Option<String>,

    /// yt-dlp format selector
    #[arg(long = "format", short = 'F')]
    pub format: Option<String>,

    /// Extract audio only
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub audio: bool,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub playlist: bool,

    /// Comma-separated subtitle languages
    #[arg(long)]
    pub subtitles: Option<String>,

    #[arg(long)]
    pub proxy: Option<String>,

    /// Bandwidth cap such as `500K` or `1.5M`
    #[arg(long)]
    pub rate: Option<String>,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub parallel: bool,

    #[arg(long = "max-workers", short = 'w')]
    pub max_workers: Option<usize>,

    #[arg(long, short, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Store the effective settings as a named profile
    #[arg(long = "save-config", value_name = "PROFILE")]
    pub save_config: Option<String>,

    /// Settings file to use instead of ~/.draxon.json
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the available formats of each URL instead of downloading
    #[arg(long = "list-formats", action = clap::ArgAction::SetTrue)]
    pub list_formats: bool,
}

/// Main entry point for the application.
///
/// # Steps
/// 1. Loads the settings file and the requested profile
/// 2. Initializes logging, at DEBUG when verbose
/// 3. Provisions the yt-dlp engine
/// 4. Runs the downloads and reports the outcome
#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = Config::default();
    if let Some(path) = &args.config {
        config.config_path = path.clone();
    }
    let mut store = ConfigStore::load(&config.config_path);
    let profile = apply_cli(&args, store.active_profile(args.profile.as_deref()));
    let resolver = store.resolver(profile);

    let level = if resolver.verbose() {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
    info!(
        profile = resolver.profile_name(),
        "Using settings from {}",
        store.path().display()
    );

    if let Some(name) = &args.save_config {
        store.upsert_profile(Profile::snapshot_of(name.clone(), &resolver.merged()));
        store.save()?;
    }

    let tokens = collect_tokens(&args).await?;
    if tokens.is_empty() {
        if args.save_config.is_some() {
            return Ok(());
        }
        error!("No URLs given; pass them as arguments, pipe them in, or use --file");
        std::process::exit(2);
    }

    let history = History::new(&config.history_path, config.history_size);
    for token in &tokens {
        let (url, _) = parse_url_spec(token);
        if let Err(e) = history.add(&url) {
            warn!("Could not update history: {}", e);
        }
    }

    let engine = Arc::new(YtDlpEngine::provision(&config).await?);
    let cancel = CancellationController::new();
    let scheduler = JobScheduler::new(engine, cancel.clone());

    if args.list_formats {
        return list_formats(&scheduler, &tokens).await;
    }

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; letting running downloads stop");
            cancel.request_stop();
        }
    });
    let reporter = tokio::spawn(report_progress(scheduler.progress()));

    let jobs = resolver.resolve_tokens(&tokens);
    let result = scheduler.run(jobs, resolver.concurrency()).await;

    reporter.abort();
    interrupt.abort();
    let manifest = result?;

    if let Err(e) = manifest.export_failures(&config.failure_report) {
        error!("Failed to write failure report: {}", e);
    } else if manifest.failed() > 0 {
        info!(
            "Failed downloads written to {}",
            config.failure_report.display()
        );
    }

    if manifest.failed() > 0 {
        std::process::exit(1);
    }
    info!("Application completed successfully");
    Ok(())
}

/// Lays the command line flags over a copy of the active profile.
///
/// The stored profile itself is never modified.
fn apply_cli(args: &Cli, mut profile: Profile) -> Profile {
    if let Some(dir) = &args.output_dir {
        profile.set(keys::OUTPUT_DIR, dir.as_str());
    }
    if let Some(template) = &args.outtmpl {
        profile.set(keys::OUTPUT_TEMPLATE, template.as_str());
    }
    if let Some(format) = &args.format {
        profile.set(keys::VIDEO_FORMAT, format.as_str());
    }
    if let Some(langs) = &args.subtitles {
        profile.set(keys::SUBTITLES, langs.as_str());
    }
    if let Some(proxy) = &args.proxy {
        profile.set(keys::PROXY, proxy.as_str());
    }
    if let Some(rate) = &args.rate {
        profile.set(keys::RATE_LIMIT, rate.as_str());
    }
    if args.audio {
        profile.set(keys::PREFER_AUDIO, true);
    }
    if args.playlist {
        profile.set(keys::PLAYLIST, true);
    }
    if args.parallel {
        profile.set(keys::PARALLEL, true);
    }
    if let Some(workers) = args.max_workers {
        profile.set(keys::MAX_WORKERS, workers as u64);
    }
    if args.verbose {
        profile.set(keys::VERBOSE, true);
    }
    profile
}

/// Gathers URL tokens from the arguments, piped stdin and the optional
/// input file.
///
/// # Errors
/// Returns error if stdin or the input file cannot be read
async fn collect_tokens(args: &Cli) -> Result<Vec<String>> {
    let mut tokens = normalize_tokens(&args.urls);
    if let Some(piped) = read_piped_stdin().await? {
        let from_stdin = tokens_from_text(&piped);
        if !from_stdin.is_empty() {
            info!("Read {} URLs from stdin", from_stdin.len());
        }
        tokens.extend(from_stdin);
    }
    if let Some(path) = &args.file {
        let from_file = read_tokens(path).await.map_err(|e| {
            AppError::Custom(format!("Cannot read {}: {}", path.display(), e))
        })?;
        info!("Read {} URLs from {}", from_file.len(), path.display());
        tokens.extend(from_file);
    }
    Ok(tokens)
}

/// Prints the ranked formats of each URL.
async fn list_formats(scheduler: &JobScheduler, tokens: &[String]) -> Result<()> {
    for token in tokens {
        let (url, _) = parse_url_spec(token);
        let catalog = match scheduler.catalog(&url).await {
            Ok(catalog) => catalog,
            Err(e) => {
                error!(url = %url, "Could not list formats: {}", e);
                continue;
            }
        };
        println!("{}", url);
        println!("  Video:");
        for format in &catalog.video {
            println!("    {:<10} {}", format.id, format.label());
        }
        println!("  Audio:");
        for format in &catalog.audio {
            println!("    {:<10} {}", format.id, format.label());
        }
        println!("  Best: {}", catalog.best_selector());
    }
    Ok(())
}

/// Logs every running download once per second.
async fn report_progress(progress: Arc<ProgressAggregator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        for (id, snapshot) in progress.all_snapshots() {
            match snapshot.phase {
                Phase::Downloading if snapshot.downloaded_bytes > 0 => {
                    let percent = snapshot
                        .percent()
                        .map(|p| format!("{:.1}%", p))
                        .unwrap_or_else(|| format_filesize(Some(snapshot.downloaded_bytes)));
                    let speed = snapshot
                        .speed_bytes_per_sec
                        .map(|s| format!("{}/s", format_filesize(Some(s as u64))))
                        .unwrap_or_else(|| "N/A".to_string());
                    info!(task = %id, "{} at {}, ETA {}s", percent, speed, snapshot.eta_seconds.unwrap_or(0));
                }
                Phase::Postprocessing => info!(task = %id, "Post-processing"),
                _ => {}
            }
        }
    }
}
