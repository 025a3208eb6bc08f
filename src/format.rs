use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Format ranking for interactive quality selection.
///
/// Raw format entries come straight from the engine's info dump and cannot
/// be trusted: anything that cannot be ranked is filtered out rather than
/// reported.

/// Engine selector used when no video candidate qualifies.
pub const FALLBACK_VIDEO_SELECTOR: &str = "bestvideo/best";
/// Engine selector used when no audio candidate qualifies.
pub const FALLBACK_AUDIO_SELECTOR: &str = "bestaudio/best";

/// One format entry as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

/// The part of the engine's info dump the core reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub webpage_url: Option<String>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatKind {
    Video,
    Audio,
    Muxed,
}

/// A ranked candidate a user can choose from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub id: String,
    pub kind: FormatKind,
    pub resolution_height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub bitrate: Option<f64>,
    pub extension: String,
    pub filesize_bytes: Option<u64>,
    pub requires_merge: bool,
}

impl FormatDescriptor {
    /// Display label, e.g. `1080p60 (mp4, video only) - 12.50 MiB`.
    pub fn label(&self) -> String {
        let size = format_filesize(self.filesize_bytes);
        match self.kind {
            FormatKind::Audio => format!(
                "{}k ({}) - {}",
                self.bitrate.unwrap_or(0.0) as u64,
                self.extension,
                size
            ),
            FormatKind::Video | FormatKind::Muxed => {
                let fps = match self.frame_rate {
                    Some(fps) if fps > 30.0 => format!("{}", fps.round() as u64),
                    _ => String::new(),
                };
                let only = if self.requires_merge { ", video only" } else { "" };
                format!(
                    "{}p{} ({}{}) - {}",
                    self.resolution_height.unwrap_or(0),
                    fps,
                    self.extension,
                    only,
                    size
                )
            }
        }
    }
}

/// Renders a byte count with binary units, or `N/A` when unknown.
pub fn format_filesize(bytes: Option<u64>) -> String {
    const KIB: f64 = 1024.0;
    let Some(b) = bytes else {
        return "N/A".to_string();
    };
    let value = b as f64;
    if value < KIB {
        format!("{} B", b)
    } else if value < KIB * KIB {
        format!("{:.2} KiB", value / KIB)
    } else if value < KIB * KIB * KIB {
        format!("{:.2} MiB", value / (KIB * KIB))
    } else {
        format!("{:.2} GiB", value / (KIB * KIB * KIB))
    }
}

/// Video and audio candidates extracted from one info dump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatCatalog {
    pub video: Vec<FormatDescriptor>,
    pub audio: Vec<FormatDescriptor>,
}

impl FormatCatalog {
    pub fn from_info(info: &RawInfo) -> Self {
        let (video, audio) = classify(&info.formats);
        Self { video, audio }
    }

    /// Selector for the best video candidate, paired with the best audio
    /// candidate when the video stream carries no sound.
    pub fn best_selector(&self) -> String {
        match self.video.first() {
            Some(video) => merge_selector(video, self.audio.first()),
            None => FALLBACK_VIDEO_SELECTOR.to_string(),
        }
    }

    pub fn best_audio_selector(&self) -> String {
        self.audio
            .first()
            .map(|a| a.id.clone())
            .unwrap_or_else(|| FALLBACK_AUDIO_SELECTOR.to_string())
    }
}

/// Builds the engine selector for a chosen video candidate.
///
/// Video-only streams are joined with the audio id (`137+140`) so the engine
/// muxes them; without an audio candidate the engine picks its best audio.
pub fn merge_selector(video: &FormatDescriptor, audio: Option<&FormatDescriptor>) -> String {
    if !video.requires_merge {
        return video.id.clone();
    }
    match audio {
        Some(audio) => format!("{}+{}", video.id, audio.id),
        None => format!("{}+bestaudio", video.id),
    }
}

fn stream_present(codec: Option<&str>, fallback: bool) -> bool {
    match codec {
        Some(codec) => {
            let codec = codec.trim();
            !codec.is_empty() && codec != "none"
        }
        None => fallback,
    }
}

fn video_key(d: &FormatDescriptor) -> (u32, i64) {
    (
        d.resolution_height.unwrap_or(0),
        d.frame_rate.map(|f| (f * 1000.0).round() as i64).unwrap_or(0),
    )
}

fn compare_video(a: &FormatDescriptor, b: &FormatDescriptor) -> Ordering {
    let ha = a.resolution_height.unwrap_or(0);
    let hb = b.resolution_height.unwrap_or(0);
    hb.cmp(&ha)
        .then_with(|| {
            b.frame_rate
                .unwrap_or(0.0)
                .total_cmp(&a.frame_rate.unwrap_or(0.0))
        })
        .then_with(|| a.extension.cmp(&b.extension))
}

fn compare_audio(a: &FormatDescriptor, b: &FormatDescriptor) -> Ordering {
    b.bitrate
        .unwrap_or(0.0)
        .total_cmp(&a.bitrate.unwrap_or(0.0))
        .then_with(|| a.extension.cmp(&b.extension))
}

/// Splits raw formats into ranked, deduplicated video and audio candidates.
///
/// Both lists are sorted best-first before deduplication, so the entry kept
/// for a resolution or bitrate tier is always its best representative.
pub fn classify(raw: &[RawFormat]) -> (Vec<FormatDescriptor>, Vec<FormatDescriptor>) {
    let mut video = Vec::new();
    let mut audio = Vec::new();

    for f in raw {
        let Some(id) = f.format_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
            continue;
        };
        let has_video = stream_present(f.vcodec.as_deref(), f.height.is_some());
        let has_audio = stream_present(f.acodec.as_deref(), f.abr.is_some());
        let extension = f.ext.clone().unwrap_or_default();
        let filesize_bytes = f.filesize.or(f.filesize_approx);

        if has_video {
            let Some(height) = f.height.filter(|h| *h > 0) else {
                continue;
            };
            video.push(FormatDescriptor {
                id: id.to_string(),
                kind: if has_audio {
                    FormatKind::Muxed
                } else {
                    FormatKind::Video
                },
                resolution_height: Some(height),
                frame_rate: f.fps.filter(|fps| fps.is_finite() && *fps > 0.0),
                bitrate: f.tbr,
                extension,
                filesize_bytes,
                requires_merge: !has_audio,
            });
        } else if has_audio {
            let Some(bitrate) = f.abr.or(f.tbr).filter(|b| b.is_finite() && *b > 0.0) else {
                continue;
            };
            audio.push(FormatDescriptor {
                id: id.to_string(),
                kind: FormatKind::Audio,
                resolution_height: None,
                frame_rate: None,
                bitrate: Some(bitrate),
                extension,
                filesize_bytes,
                requires_merge: false,
            });
        }
    }

    video.sort_by(compare_video);
    audio.sort_by(compare_audio);

    let mut tiers = HashSet::new();
    let mut labels = HashSet::new();
    // Only kept entries claim their keys.
    video.retain(|d| {
        let tier = video_key(d);
        let label = (d.kind, d.resolution_height, d.extension.clone());
        if tiers.contains(&tier) || labels.contains(&label) {
            return false;
        }
        tiers.insert(tier);
        labels.insert(label);
        true
    });

    let mut seen = HashSet::new();
    audio.retain(|d| seen.insert(d.bitrate.unwrap_or(0.0) as u64));

    (video, audio)
}
