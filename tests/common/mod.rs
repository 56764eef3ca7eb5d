//! Deterministic stand-ins for the speech service and the extractor.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use avatar_voice::transcode::PassthroughTranscoder;
use avatar_voice::{
    MouthCue, PipelineConfig, SpeechPipeline, SpeechSynthesizer, TempWorkspace, Transcoder,
    VisemeExtractor,
};

/// Returns fixed audio, optionally failing or stalling for chosen texts.
#[derive(Default)]
pub struct StubSynthesizer {
    pub audio: Vec<u8>,
    pub fail_for: Vec<String>,
    pub delays: HashMap<String, Duration>,
    pub calls: Mutex<Vec<String>>,
    pub tag_with_text: bool,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StubSynthesizer {
    pub fn with_audio(audio: Vec<u8>) -> Self {
        Self {
            audio,
            ..Self::default()
        }
    }

    /// Append the spoken text to the audio so outputs trace back to inputs.
    pub fn tagged(mut self) -> Self {
        self.tag_with_text = true;
        self
    }

    pub fn failing_for(mut self, text: &str) -> Self {
        self.fail_for.push(text.to_string());
        self
    }

    pub fn delayed(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(text.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self
            .delays
            .get(text)
            .copied()
            .unwrap_or(Duration::from_millis(50));
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_for.iter().any(|t| t == text) {
            bail!("stub synthesis failure for '{text}'");
        }
        let mut audio = self.audio.clone();
        if self.tag_with_text {
            audio.extend_from_slice(text.as_bytes());
        }
        Ok(audio)
    }
}

/// Returns a fixed cue list and records what it was asked to process.
pub struct StubExtractor {
    pub cues: Option<Vec<MouthCue>>,
    pub seen: Mutex<Vec<(PathBuf, bool)>>,
}

impl StubExtractor {
    pub fn returning(cues: Vec<MouthCue>) -> Self {
        Self {
            cues: Some(cues),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            cues: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<(PathBuf, bool)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisemeExtractor for StubExtractor {
    async fn generate(&self, audio: &Path) -> Option<Vec<MouthCue>> {
        self.seen
            .lock()
            .unwrap()
            .push((audio.to_path_buf(), audio.exists()));
        self.cues.clone()
    }
}

/// Builds a pipeline over a fresh scratch directory.
pub struct Harness {
    pub pipeline: SpeechPipeline,
    pub synthesizer: Arc<StubSynthesizer>,
    pub extractor: Arc<StubExtractor>,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(synthesizer: StubSynthesizer, extractor: StubExtractor) -> Self {
        Self::with_config(synthesizer, extractor, PipelineConfig::default())
    }

    pub fn with_config(
        synthesizer: StubSynthesizer,
        extractor: StubExtractor,
        config: PipelineConfig,
    ) -> Self {
        Self::with_parts(
            synthesizer,
            Arc::new(PassthroughTranscoder),
            extractor,
            config,
        )
    }

    pub fn with_parts(
        synthesizer: StubSynthesizer,
        transcoder: Arc<dyn Transcoder>,
        extractor: StubExtractor,
        mut config: PipelineConfig,
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        config.temp_root = scratch.path().to_path_buf();
        let synthesizer = Arc::new(synthesizer);
        let extractor = Arc::new(extractor);
        let pipeline = SpeechPipeline::new(
            config,
            synthesizer.clone(),
            transcoder,
            extractor.clone(),
            Arc::new(TempWorkspace::new(scratch.path())),
        );
        Self {
            pipeline,
            synthesizer,
            extractor,
            scratch,
        }
    }

    /// Every regular file left anywhere under the scratch root.
    pub fn leftover_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut out = Vec::new();
        walk(self.scratch.path(), &mut out);
        out
    }
}
