use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

/// Resolution of per-URL download settings.
///
/// Settings are layered defaults -> profile -> per-URL overrides. Each
/// layer replaces whole keys; a value that cannot be read as the type its
/// key expects is skipped, so the next lower layer decides.

pub type Settings = Map<String, Value>;

/// Setting keys understood by the resolver.
pub mod keys {
    pub const OUTPUT_DIR: &str = "output_dir";
    pub const OUTPUT_TEMPLATE: &str = "output_template";
    pub const VIDEO_FORMAT: &str = "video_format";
    pub const SUBTITLES: &str = "subtitles_languages";
    pub const PROXY: &str = "proxy";
    pub const RATE_LIMIT: &str = "rate_limit";
    pub const RESUME: &str = "resume_download";
    pub const PLAYLIST: &str = "playlist";
    pub const PREFER_AUDIO: &str = "prefer_audio";
    pub const PARALLEL: &str = "parallel_download";
    pub const MAX_WORKERS: &str = "max_workers";
    pub const VERBOSE: &str = "verbose";
}

pub const DEFAULT_OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
pub const DEFAULT_FORMAT: &str = "best";
pub const AUDIO_FORMAT: &str = "bestaudio/best";
pub const DEFAULT_WORKERS: usize = 2;

static RATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)([KMG]?)$").expect("valid rate pattern"));

/// A named bag of default option values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub settings: Settings,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::new(),
        }
    }

    /// The built-in defaults every session starts from.
    pub fn builtin() -> Self {
        Self::new("defaults")
            .with(keys::OUTPUT_DIR, ".")
            .with(keys::OUTPUT_TEMPLATE, DEFAULT_OUTPUT_TEMPLATE)
            .with(keys::VIDEO_FORMAT, DEFAULT_FORMAT)
            .with(keys::SUBTITLES, "en,ru")
            .with(keys::PROXY, "")
            .with(keys::RATE_LIMIT, "")
            .with(keys::RESUME, true)
            .with(keys::VERBOSE, false)
            .with(keys::PARALLEL, false)
            .with(keys::MAX_WORKERS, DEFAULT_WORKERS as u64)
    }

    /// Captures a merged view of settings under a new name.
    pub fn snapshot_of(name: impl Into<String>, settings: &Settings) -> Self {
        Self {
            name: name.into(),
            settings: settings.clone(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.settings.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Keys of `self` laid over `base`.
    pub fn merged_over(&self, base: &Profile) -> Settings {
        let mut merged = base.settings.clone();
        for (key, value) in &self.settings {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// A per-URL deviation from the active profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideToken {
    Audio(bool),
    Playlist(bool),
    Format(String),
    OutputTemplate(String),
    Proxy(String),
    Rate(String),
    /// Unrecognized option handed to the engine verbatim; `None` is a bare flag.
    Opaque { key: String, value: Option<String> },
}

impl OverrideToken {
    /// Parses one `key=value` or bare-flag item. Blank items yield `None`.
    pub fn parse(item: &str) -> Option<Self> {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        if let Some((key, value)) = item.split_once('=') {
            let key = key.trim();
            let value = value.trim().to_string();
            return Some(match key {
                "format" => Self::Format(value),
                "outtmpl" => Self::OutputTemplate(value),
                "proxy" => Self::Proxy(value),
                "rate" => Self::Rate(value),
                _ => Self::Opaque {
                    key: key.to_string(),
                    value: Some(value),
                },
            });
        }
        Some(match item.to_lowercase().as_str() {
            "audio" | "extract_audio" => Self::Audio(true),
            "no-audio" | "noaudio" => Self::Audio(false),
            "playlist" | "play" => Self::Playlist(true),
            "no-playlist" | "noplay" => Self::Playlist(false),
            _ => Self::Opaque {
                key: item.to_string(),
                value: None,
            },
        })
    }

    fn render(&self) -> String {
        match self {
            Self::Audio(true) => "audio".to_string(),
            Self::Audio(false) => "no-audio".to_string(),
            Self::Playlist(true) => "playlist".to_string(),
            Self::Playlist(false) => "no-playlist".to_string(),
            Self::Format(v) => format!("format={}", v),
            Self::OutputTemplate(v) => format!("outtmpl={}", v),
            Self::Proxy(v) => format!("proxy={}", v),
            Self::Rate(v) => format!("rate={}", v),
            Self::Opaque { key, value: None } => key.clone(),
            Self::Opaque {
                key,
                value: Some(v),
            } => format!("{}={}", key, v),
        }
    }
}

/// Splits `URL||flag,key=value` into the URL and its override tokens.
pub fn parse_url_spec(token: &str) -> (String, Vec<OverrideToken>) {
    match token.split_once("||") {
        Some((url, spec)) => (
            url.trim().to_string(),
            spec.split(',').filter_map(OverrideToken::parse).collect(),
        ),
        None => (token.trim().to_string(), Vec::new()),
    }
}

/// Writes a URL and its overrides back in the `URL||...` syntax.
pub fn render_url_spec(url: &str, overrides: &[OverrideToken]) -> String {
    if overrides.is_empty() {
        return url.to_string();
    }
    let items: Vec<String> = overrides.iter().map(OverrideToken::render).collect();
    format!("{}||{}", url, items.join(","))
}

/// Parses a rate limit such as `500K` or `1.5M` into bytes per second.
///
/// Anything that does not match, and zero, means no limit.
pub fn parse_rate_limit(input: &str) -> Option<u64> {
    let caps = RATE_PATTERN.captures(input.trim())?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: f64 = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(unit) if unit == "K" => 1024.0,
        Some(unit) if unit == "M" => 1024.0 * 1024.0,
        Some(unit) if unit == "G" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    let bytes = (number * multiplier) as u64;
    (bytes > 0).then_some(bytes)
}

/// Fully resolved, engine-ready configuration for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub url: String,
    pub format_selector: String,
    pub output_template: String,
    pub proxy: Option<String>,
    pub rate_limit_bytes_per_sec: Option<u64>,
    pub resume: bool,
    pub subtitle_langs: BTreeSet<String>,
    pub audio_extract: bool,
    pub playlist_allowed: bool,
    pub extra: BTreeMap<String, Option<String>>,
}

impl JobSpec {
    /// A job with engine defaults for everything but the URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        let url: String = url.into();
        ProfileResolver::new(Profile::builtin(), Profile::default()).resolve(&url, &[])
    }

    /// Whether the engine runs a step after fetching bytes: audio extraction,
    /// or muxing separately fetched streams.
    pub fn declares_postprocessing(&self) -> bool {
        self.audio_extract || self.format_selector.contains('+')
    }
}

fn read_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn read_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().filter(|n| *n <= 1).map(|n| n == 1),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn read_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn read_langs(value: &Value) -> Option<BTreeSet<String>> {
    let collect = |items: Vec<String>| {
        items
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect::<BTreeSet<_>>()
    };
    match value {
        Value::String(s) => Some(collect(s.split(',').map(str::to_string).collect())),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(collect),
        _ => None,
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn join_template(output_dir: &str, template: &str) -> String {
    Path::new(output_dir)
        .join(template)
        .to_string_lossy()
        .into_owned()
}

/// Merges defaults, a named profile and per-URL overrides into [`JobSpec`]s.
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    defaults: Profile,
    profile: Profile,
    builtin: Profile,
}

impl ProfileResolver {
    pub fn new(defaults: Profile, profile: Profile) -> Self {
        Self {
            defaults,
            profile,
            builtin: Profile::builtin(),
        }
    }

    pub fn profile_name(&self) -> &str {
        &self.profile.name
    }

    /// Profile keys laid over the defaults.
    pub fn merged(&self) -> Settings {
        self.profile.merged_over(&self.defaults)
    }

    /// Looks a key up profile-first, skipping values `read` cannot accept.
    fn lookup<T>(&self, key: &str, read: impl Fn(&Value) -> Option<T>) -> Option<T> {
        [&self.profile, &self.defaults, &self.builtin]
            .into_iter()
            .filter_map(|layer| layer.get(key).map(|v| (layer, v)))
            .find_map(|(layer, value)| {
                let parsed = read(value);
                if parsed.is_none() {
                    debug!(profile = %layer.name, key, ?value, "Ignoring unreadable setting");
                }
                parsed
            })
    }

    fn string(&self, key: &str) -> String {
        self.lookup(key, read_string).unwrap_or_default()
    }

    fn flag(&self, key: &str) -> bool {
        self.lookup(key, read_bool).unwrap_or(false)
    }

    /// Pool size for the session: 1 unless parallel mode is on.
    pub fn concurrency(&self) -> usize {
        if self.flag(keys::PARALLEL) {
            self.lookup(keys::MAX_WORKERS, read_count)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_WORKERS)
        } else {
            1
        }
    }

    pub fn verbose(&self) -> bool {
        self.flag(keys::VERBOSE)
    }

    /// Resolves the configuration for one URL. Never fails.
    pub fn resolve(&self, url: &str, overrides: &[OverrideToken]) -> JobSpec {
        let output_dir = non_empty(self.string(keys::OUTPUT_DIR)).unwrap_or_else(|| ".".into());
        let template = non_empty(self.string(keys::OUTPUT_TEMPLATE))
            .unwrap_or_else(|| DEFAULT_OUTPUT_TEMPLATE.into());
        let mut output_template = join_template(&output_dir, &template);
        let mut format_selector =
            non_empty(self.string(keys::VIDEO_FORMAT)).unwrap_or_else(|| DEFAULT_FORMAT.into());
        let mut proxy = non_empty(self.string(keys::PROXY));
        let mut rate_limit_bytes_per_sec = parse_rate_limit(&self.string(keys::RATE_LIMIT));
        let resume = self.lookup(keys::RESUME, read_bool).unwrap_or(true);
        let subtitle_langs = self.lookup(keys::SUBTITLES, read_langs).unwrap_or_default();
        let mut audio_extract = self.flag(keys::PREFER_AUDIO);
        let mut playlist_allowed = self.flag(keys::PLAYLIST);
        let mut extra = BTreeMap::new();

        for token in overrides {
            match token {
                OverrideToken::Audio(on) => audio_extract = *on,
                OverrideToken::Playlist(on) => playlist_allowed = *on,
                OverrideToken::Format(selector) if !selector.is_empty() => {
                    format_selector = selector.clone()
                }
                OverrideToken::OutputTemplate(t) if !t.is_empty() => {
                    output_template = join_template(&output_dir, t)
                }
                OverrideToken::Proxy(p) => proxy = non_empty(p.clone()),
                OverrideToken::Rate(r) => rate_limit_bytes_per_sec = parse_rate_limit(r),
                OverrideToken::Opaque { key, value } => {
                    extra.insert(key.clone(), value.clone());
                }
                OverrideToken::Format(_) | OverrideToken::OutputTemplate(_) => {}
            }
        }

        if audio_extract {
            format_selector = AUDIO_FORMAT.to_string();
        }

        JobSpec {
            url: url.trim().to_string(),
            format_selector,
            output_template,
            proxy,
            rate_limit_bytes_per_sec,
            resume,
            subtitle_langs,
            audio_extract,
            playlist_allowed,
            extra,
        }
    }

    /// Resolves every `URL||overrides` token in order.
    pub fn resolve_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<JobSpec> {
        tokens
            .iter()
            .map(|token| {
                let (url, overrides) = parse_url_spec(token.as_ref());
                self.resolve(&url, &overrides)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn resolver(profile: Profile) -> ProfileResolver {
        ProfileResolver::new(Profile::builtin(), profile)
    }

    #[test]
    fn rate_limit_values() {
        assert_eq!(parse_rate_limit("500K"), Some(512_000));
        assert_eq!(parse_rate_limit("1M"), Some(1_048_576));
        assert_eq!(parse_rate_limit("2"), Some(2));
        assert_eq!(parse_rate_limit("bogus"), None);
        assert_eq!(parse_rate_limit("1.5k"), Some(1536));
        assert_eq!(parse_rate_limit(" 1G "), Some(1_073_741_824));
        assert_eq!(parse_rate_limit("0"), None);
        assert_eq!(parse_rate_limit(""), None);
        assert_eq!(parse_rate_limit("10KB"), None);
    }

    #[test]
    fn resolve_is_idempotent() {
        let profile = Profile::new("music")
            .with(keys::SUBTITLES, "ru, en")
            .with(keys::RATE_LIMIT, "1M");
        let r = resolver(profile);
        assert_eq!(r.resolve("https://a.example/v", &[]), r.resolve("https://a.example/v", &[]));
    }

    #[test]
    fn defaults_produce_builtin_job() {
        let job = resolver(Profile::default()).resolve("https://a.example/v", &[]);
        assert_eq!(job.format_selector, "best");
        assert_eq!(
            job.output_template,
            join_template(".", DEFAULT_OUTPUT_TEMPLATE)
        );
        assert!(job.resume);
        assert!(!job.playlist_allowed);
        assert_eq!(job.proxy, None);
        assert_eq!(job.rate_limit_bytes_per_sec, None);
        let langs: Vec<_> = job.subtitle_langs.iter().cloned().collect();
        assert_eq!(langs, vec!["en".to_string(), "ru".to_string()]);
    }

    #[test]
    fn layers_apply_in_order() {
        let defaults = Profile::builtin().with(keys::PROXY, "http://default:1");
        let profile = Profile::new("work")
            .with(keys::PROXY, "http://profile:2")
            .with(keys::VIDEO_FORMAT, "bv*+ba");
        let r = ProfileResolver::new(defaults, profile);

        let job = r.resolve("u", &[]);
        assert_eq!(job.proxy.as_deref(), Some("http://profile:2"));
        assert_eq!(job.format_selector, "bv*+ba");

        let job = r.resolve("u", &[OverrideToken::Proxy("socks5://url:3".into())]);
        assert_eq!(job.proxy.as_deref(), Some("socks5://url:3"));
    }

    #[test]
    fn unreadable_profile_value_falls_back_to_defaults() {
        let profile = Profile::new("broken")
            .with(keys::RESUME, json!({"nested": true}))
            .with(keys::OUTPUT_DIR, json!([1, 2]));
        let defaults = Profile::builtin()
            .with(keys::RESUME, false)
            .with(keys::OUTPUT_DIR, "/media");
        let job = ProfileResolver::new(defaults, profile).resolve("u", &[]);
        assert!(!job.resume);
        assert_eq!(job.output_template, join_template("/media", DEFAULT_OUTPUT_TEMPLATE));
    }

    #[test]
    fn overrides_from_url_spec() {
        let (url, overrides) =
            parse_url_spec(" https://a.example/v ||audio, rate=500K ,, outtmpl=clips/%(id)s.%(ext)s,sleep-interval=3,no-playlist,embed-thumbnail");
        assert_eq!(url, "https://a.example/v");
        assert_eq!(overrides.len(), 6);

        let profile = Profile::new("p")
            .with(keys::OUTPUT_DIR, "/data")
            .with(keys::PLAYLIST, true);
        let job = resolver(profile).resolve(&url, &overrides);

        assert!(job.audio_extract);
        assert_eq!(job.format_selector, AUDIO_FORMAT);
        assert!(job.declares_postprocessing());
        assert_eq!(job.rate_limit_bytes_per_sec, Some(512_000));
        assert_eq!(job.output_template, join_template("/data", "clips/%(id)s.%(ext)s"));
        assert!(!job.playlist_allowed);
        assert_eq!(job.extra.get("sleep-interval"), Some(&Some("3".to_string())));
        assert_eq!(job.extra.get("embed-thumbnail"), Some(&None));
    }

    #[test]
    fn absolute_override_template_is_kept() {
        let job = resolver(Profile::default()).resolve(
            "u",
            &[OverrideToken::OutputTemplate("/abs/%(title)s.%(ext)s".into())],
        );
        assert_eq!(job.output_template, "/abs/%(title)s.%(ext)s");
    }

    #[test]
    fn malformed_rate_override_means_no_limit() {
        let profile = Profile::new("p").with(keys::RATE_LIMIT, "2M");
        let job = resolver(profile).resolve("u", &[OverrideToken::Rate("fast".into())]);
        assert_eq!(job.rate_limit_bytes_per_sec, None);
    }

    #[test]
    fn no_audio_beats_prefer_audio() {
        let profile = Profile::new("p").with(keys::PREFER_AUDIO, true);
        let r = resolver(profile);
        assert!(r.resolve("u", &[]).audio_extract);
        let job = r.resolve("u", &[OverrideToken::Audio(false)]);
        assert!(!job.audio_extract);
        assert_eq!(job.format_selector, DEFAULT_FORMAT);
    }

    #[test]
    fn url_spec_round_trips_through_rendering() {
        let token = "https://a.example/v||audio,format=137+140,no-playlist,x";
        let (url, overrides) = parse_url_spec(token);
        assert_eq!(render_url_spec(&url, &overrides), token);
        assert_eq!(render_url_spec("https://b", &[]), "https://b");
    }

    #[test]
    fn concurrency_follows_parallel_flag() {
        let r = resolver(Profile::new("p").with(keys::MAX_WORKERS, 4u64));
        assert_eq!(r.concurrency(), 1);
        let r = resolver(
            Profile::new("p")
                .with(keys::PARALLEL, true)
                .with(keys::MAX_WORKERS, "4"),
        );
        assert_eq!(r.concurrency(), 4);
    }

    #[test]
    fn snapshot_saves_merged_settings() {
        let r = resolver(Profile::new("p").with(keys::VIDEO_FORMAT, "worst"));
        let saved = Profile::snapshot_of("mine", &r.merged());
        assert_eq!(saved.get(keys::VIDEO_FORMAT), Some(&json!("worst")));
        assert_eq!(saved.get(keys::RESUME), Some(&json!(true)));
    }
}
