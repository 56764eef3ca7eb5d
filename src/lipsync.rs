//! Mouth-shape timelines for avatar lip-sync.
//!
//! [`RhubarbExtractor`] runs [Rhubarb Lip Sync](https://github.com/DanielSWolf/rhubarb-lip-sync)
//! against an audio file and reads back its JSON cue list. Raw Rhubarb
//! output is noisy for short TTS clips (very short cues make the mouth
//! jitter, long pauses leave it undefined), so every timeline goes through
//! [`post_process`] before it reaches the client.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempPath;

use crate::probe::{run_with_timeout, stderr_text};
use crate::workspace::discard;

/// Rhubarb's mouth shapes. `X` is the closed, resting mouth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Viseme {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    X,
}

impl Viseme {
    pub const NEUTRAL: Viseme = Viseme::X;

    /// Map an extractor label onto the alphabet; unknown labels rest.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "A" => Viseme::A,
            "B" => Viseme::B,
            "C" => Viseme::C,
            "D" => Viseme::D,
            "E" => Viseme::E,
            "F" => Viseme::F,
            "G" => Viseme::G,
            "H" => Viseme::H,
            "X" => Viseme::X,
            other => {
                log::debug!("Unknown viseme label '{other}', using rest shape");
                Viseme::NEUTRAL
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouthCue {
    pub start: f64,
    pub end: f64,
    pub value: Viseme,
}

impl MouthCue {
    pub fn new(start: f64, end: f64, value: Viseme) -> Self {
        Self { start, end, value }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Thresholds for [`post_process`], in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueTimings {
    pub min_duration: f64,
    pub max_gap: f64,
}

impl Default for CueTimings {
    fn default() -> Self {
        Self {
            min_duration: 0.05,
            max_gap: 0.1,
        }
    }
}

/// Float slack when comparing durations built from additions.
const TIME_EPSILON: f64 = 1e-9;

/// Clean a raw cue list into a sorted, non-overlapping timeline where every
/// cue lasts at least `min_duration` and no gap exceeds `max_gap`.
pub fn post_process(raw: Vec<MouthCue>, timings: CueTimings) -> Vec<MouthCue> {
    let original = raw.len();
    let mut sorted: Vec<MouthCue> = raw
        .into_iter()
        .filter(|c| c.start.is_finite() && c.end.is_finite())
        .collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut processed: Vec<MouthCue> = Vec::with_capacity(sorted.len() * 2);
    for mut cue in sorted {
        if let Some(prev_end) = processed.last().map(|p| p.end) {
            // An earlier cue may have been stretched past this one's start.
            if cue.start < prev_end {
                cue.start = prev_end;
            }
            if cue.start - prev_end > timings.max_gap {
                processed.push(MouthCue::new(prev_end, cue.start, Viseme::NEUTRAL));
            }
        }
        if cue.duration() < timings.min_duration {
            cue.end = cue.start + timings.min_duration;
        }
        processed.push(cue);
    }

    processed.retain(|c| c.duration() + TIME_EPSILON >= timings.min_duration);
    log::debug!(
        "Post-processed {original} cues to {} cues",
        processed.len()
    );
    processed
}

/// Parse extractor output: either Rhubarb's document with a `mouthCues`
/// array or a bare cue array. Entries missing a field are skipped.
pub fn parse_cues(json: &str) -> Result<Vec<MouthCue>> {
    let doc: Value = serde_json::from_str(json).context("extractor output is not JSON")?;
    let entries = match &doc {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("mouthCues") {
            Some(Value::Array(items)) => items,
            _ => bail!("extractor output has no mouthCues array"),
        },
        _ => bail!("unexpected extractor output shape"),
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let start = entry.get("start")?.as_f64()?;
            let end = entry.get("end")?.as_f64()?;
            let value = entry.get("value")?.as_str()?;
            Some(MouthCue::new(start, end, Viseme::from_label(value)))
        })
        .collect())
}

/// Length of a timeline in seconds, rounded to two decimals.
pub fn timeline_duration(cues: &[MouthCue]) -> f64 {
    let end = cues.iter().map(|c| c.end).fold(0.0_f64, f64::max);
    (end * 100.0).round() / 100.0
}

#[async_trait]
pub trait VisemeExtractor: Send + Sync {
    /// Produce a cleaned timeline for `audio`, or `None` on any failure.
    async fn generate(&self, audio: &Path) -> Option<Vec<MouthCue>>;
}

pub struct RhubarbExtractor {
    binary: PathBuf,
    timings: CueTimings,
    timeout: Duration,
}

impl RhubarbExtractor {
    pub fn new(binary: impl Into<PathBuf>, timings: CueTimings, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timings,
            timeout,
        }
    }

    async fn extract(&self, audio: &Path) -> Result<Vec<MouthCue>> {
        if !tokio::fs::try_exists(audio).await.unwrap_or(false) {
            bail!("audio file not found: {}", audio.display());
        }
        if !tokio::fs::try_exists(&self.binary).await.unwrap_or(false) {
            bail!(
                "Rhubarb binary not found at {}; check RHUBARB_PATH",
                self.binary.display()
            );
        }

        let mut json_path = OsString::from(audio.as_os_str());
        json_path.push(".json");
        let output_file = TempPath::from_path(PathBuf::from(json_path));

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(["-f", "json", "-o"])
            .arg(&*output_file)
            .arg(audio)
            .args(["-r", "phonetic", "--machineReadable"]);
        let output = run_with_timeout(cmd, self.timeout).await?;
        if !output.status.success() {
            bail!(
                "Rhubarb exited with {}: {}",
                output.status,
                stderr_text(&output)
            );
        }

        let json = tokio::fs::read_to_string(&output_file)
            .await
            .with_context(|| format!("missing Rhubarb output {}", output_file.display()))?;
        discard(output_file);
        log::debug!("Rhubarb output for {}: {json}", audio.display());

        let raw = parse_cues(&json)?;
        Ok(post_process(raw, self.timings))
    }
}

#[async_trait]
impl VisemeExtractor for RhubarbExtractor {
    async fn generate(&self, audio: &Path) -> Option<Vec<MouthCue>> {
        log::info!("Generating lipsync data for {}", audio.display());
        match self.extract(audio).await {
            Ok(cues) => {
                log::info!(
                    "Generated {} mouth cues ({:.2}s) for {}",
                    cues.len(),
                    timeline_duration(&cues),
                    audio.display()
                );
                Some(cues)
            }
            Err(e) => {
                log::error!("Lipsync generation failed for {}: {e:#}", audio.display());
                None
            }
        }
    }
}
