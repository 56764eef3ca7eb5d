//! Runtime configuration for the speech pipeline.
//!
//! Every tunable has a literal default in [`PipelineConfig::default`]. The
//! binary overlays environment variables on top via
//! [`PipelineConfig::from_env`], after `.env` has been loaded:
//!
//!  * `FFMPEG_PATH`: explicit ffmpeg binary, probed before the usual
//!    install locations.
//!  * `RHUBARB_PATH`: Rhubarb Lip Sync binary.
//!  * `VOICE_TEMP_DIR`: scratch root for per-conversation audio files.
//!  * `TTS_BASE_URL`, `TTS_API_KEY`, `TTS_MODEL`, `TTS_VOICE`: speech service.
//!  * `TTS_MAX_CHARS`: length budget for a single synthesis request.
//!  * `LIPSYNC_MIN_CUE_MS`, `LIPSYNC_MAX_GAP_MS`: mouth cue thresholds.
//!  * `TEMP_SWEEP_INTERVAL_SECS`, `TEMP_MAX_AGE_SECS`: periodic cleanup.
//!  * `INCLUDE_AUDIO`: set to `false` to skip synthesis entirely.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::lipsync::CueTimings;

/// Character budget accepted by the speech service in one request.
pub const DEFAULT_MAX_SYNTHESIS_CHARS: usize = 2500;

/// Conventional ffmpeg install locations, probed after the override.
pub const FFMPEG_CANDIDATES: &[&str] = &[
    "/usr/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    "/opt/local/bin/ffmpeg",
    "ffmpeg",
];

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub max_chars: usize,
    pub timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "nova".to_string(),
            max_chars: DEFAULT_MAX_SYNTHESIS_CHARS,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Full pipeline configuration. Binary paths are read-only after
/// construction and shared by every run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffmpeg_candidates: Vec<PathBuf>,
    pub rhubarb_path: PathBuf,
    pub temp_root: PathBuf,
    pub synthesis: SynthesisConfig,
    pub cue_timings: CueTimings,
    /// Upper bound for one ffmpeg or Rhubarb invocation.
    pub process_timeout: Duration,
    /// Upper bound for a single `-version` probe.
    pub probe_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_file_age: Duration,
    pub include_audio: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffmpeg_candidates: FFMPEG_CANDIDATES.iter().map(PathBuf::from).collect(),
            rhubarb_path: default_rhubarb_path(),
            temp_root: default_temp_root(),
            synthesis: SynthesisConfig::default(),
            cue_timings: CueTimings::default(),
            process_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10 * 60),
            max_file_age: Duration::from_secs(30 * 60),
            include_audio: true,
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from the process environment, falling back to
    /// the defaults for anything unset, unparseable or out of range.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = EnvSource(lookup);
        let mut config = Self::default();

        if let Some(path) = vars.string("FFMPEG_PATH") {
            config.ffmpeg_path = Some(PathBuf::from(path));
        }
        if let Some(path) = vars.string("RHUBARB_PATH") {
            config.rhubarb_path = PathBuf::from(path);
        }
        if let Some(dir) = vars.string("VOICE_TEMP_DIR") {
            config.temp_root = PathBuf::from(dir);
        }

        if let Some(url) = vars.string("TTS_BASE_URL") {
            config.synthesis.base_url = url;
        }
        config.synthesis.api_key = vars.string("TTS_API_KEY");
        if let Some(model) = vars.string("TTS_MODEL") {
            config.synthesis.model = model;
        }
        if let Some(voice) = vars.string("TTS_VOICE") {
            config.synthesis.voice = voice;
        }
        // Below this the ellipsis alone overruns the budget.
        config.synthesis.max_chars =
            vars.parse_where("TTS_MAX_CHARS", config.synthesis.max_chars, |n| *n >= 4);

        let min_ms = vars.parse("LIPSYNC_MIN_CUE_MS", DEFAULT_MIN_CUE_MS);
        let gap_ms = vars.parse("LIPSYNC_MAX_GAP_MS", DEFAULT_MAX_GAP_MS);
        // A gap filler shorter than the floor would be dropped again.
        let (min_ms, gap_ms) = if gap_ms >= min_ms {
            (min_ms, gap_ms)
        } else {
            log::warn!(
                "LIPSYNC_MAX_GAP_MS={gap_ms} is below LIPSYNC_MIN_CUE_MS={min_ms}, using defaults"
            );
            (DEFAULT_MIN_CUE_MS, DEFAULT_MAX_GAP_MS)
        };
        config.cue_timings = CueTimings {
            min_duration: min_ms as f64 / 1000.0,
            max_gap: gap_ms as f64 / 1000.0,
        };

        config.sweep_interval = Duration::from_secs(vars.parse_where(
            "TEMP_SWEEP_INTERVAL_SECS",
            config.sweep_interval.as_secs(),
            |secs| *secs > 0,
        ));
        config.max_file_age = Duration::from_secs(
            vars.parse("TEMP_MAX_AGE_SECS", config.max_file_age.as_secs()),
        );
        config.include_audio = vars.parse("INCLUDE_AUDIO", config.include_audio);

        config
    }
}

const DEFAULT_MIN_CUE_MS: u64 = 50;
const DEFAULT_MAX_GAP_MS: u64 = 100;

/// Rhubarb ships one binary per platform next to the service.
fn default_rhubarb_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("./bin/rhubarb-macos")
    } else {
        PathBuf::from("./bin/rhubarb-linux")
    }
}

fn default_temp_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("avatar-voice")
}

struct EnvSource<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr + Copy>(&self, key: &str, default: T) -> T {
        self.parse_where(key, default, |_| true)
    }

    fn parse_where<T: FromStr + Copy>(&self, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T {
        let Some(raw) = self.string(key) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) if valid(&value) => value,
            Ok(_) => {
                log::warn!("Ignoring out-of-range {key}='{raw}', using default");
                default
            }
            Err(_) => {
                log::warn!("Ignoring unparseable {key}='{raw}', using default");
                default
            }
        }
    }
}
