//! Conversion of synthesized audio into the format Rhubarb reads.
//!
//! The speech service returns MP3, while Rhubarb only understands WAV and
//! Ogg Vorbis. Conversion is best-effort: whenever ffmpeg is missing or
//! fails, the original file is handed on unchanged and the extractor gets
//! a chance with it anyway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tempfile::TempPath;

use crate::probe::{run_with_timeout, stderr_text, BinaryResolver};

#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Return a path in the extractor's format. Never fails: the source
    /// path itself is the fallback.
    async fn to_extractor_format(&self, source: &Path) -> PathBuf;
}

/// Hands every file through untouched.
pub struct PassthroughTranscoder;

#[async_trait]
impl Transcoder for PassthroughTranscoder {
    async fn to_extractor_format(&self, source: &Path) -> PathBuf {
        source.to_path_buf()
    }
}

pub struct FfmpegTranscoder {
    resolver: Arc<BinaryResolver>,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(resolver: Arc<BinaryResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    async fn convert(&self, ffmpeg: &Path, source: &Path) -> Result<PathBuf> {
        // Removes a half-written target on failure or cancellation.
        let target = TempPath::from_path(wav_target(source));

        let mut cmd = tokio::process::Command::new(ffmpeg);
        cmd.arg("-y")
            .args(["-loglevel", "error"])
            .arg("-i")
            .arg(source)
            .args(["-ac", "1", "-acodec", "pcm_s16le"])
            .arg(&*target);
        let output = run_with_timeout(cmd, self.timeout).await?;

        if !output.status.success() {
            bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_text(&output)
            );
        }
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            bail!("ffmpeg reported success but {} is missing", target.display());
        }
        target.keep().context("failed to keep converted audio")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn to_extractor_format(&self, source: &Path) -> PathBuf {
        let Some(ffmpeg) = self.resolver.resolve_async().await else {
            log::warn!(
                "ffmpeg unavailable, passing {} through unconverted",
                source.display()
            );
            return source.to_path_buf();
        };
        match self.convert(&ffmpeg, source).await {
            Ok(target) => {
                log::debug!("Converted {} to {}", source.display(), target.display());
                target
            }
            Err(e) => {
                log::warn!("Audio conversion failed for {}: {e:#}", source.display());
                source.to_path_buf()
            }
        }
    }
}

/// Sibling WAV path in the same scratch directory.
fn wav_target(source: &Path) -> PathBuf {
    let target = source.with_extension("wav");
    if target == source {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        source.with_file_name(format!("{stem}-pcm.wav"))
    } else {
        target
    }
}
