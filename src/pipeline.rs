//! Fan-out/fan-in orchestration of one chat turn.
//!
//! A reply holds only a handful of utterances, and each one spends almost
//! all of its time waiting on the network or on a child process, so every
//! utterance gets its own task. The run has two phases:
//!
//!  1. synthesize every speakable utterance concurrently;
//!  2. for every utterance that got audio, concurrently write it to the
//!     conversation's scratch dir, convert it and extract mouth cues.
//!
//! Each phase joins all of its tasks before the next starts. Results are
//! stored by input index, so completion order never reorders the reply, and
//! a failure in one task only empties that utterance's enrichment. The
//! whole run races the caller's cancellation token: on cancel the in-flight
//! tasks are aborted (child processes die with them, scratch files are
//! deleted by their guards) and nothing partial is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tempfile::TempPath;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::lipsync::{MouthCue, RhubarbExtractor, VisemeExtractor};
use crate::probe::BinaryResolver;
use crate::reply::{assemble, encode_audio, parse_reply, EnrichedUtterance, RenderedReply, Utterance};
use crate::sanitize::{is_blank, sanitize, truncate_for_synthesis};
use crate::synthesis::{HttpSynthesizer, SpeechSynthesizer};
use crate::transcode::{FfmpegTranscoder, Transcoder};
use crate::workspace::{discard, stage_file, TempWorkspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisState {
    Skipped,
    Synthesized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeState {
    Skipped,
    Transcoded,
    /// Conversion was unavailable or failed; the original file was used.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LipsyncState {
    Skipped,
    Generated,
    Failed,
}

/// How far one utterance got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceReport {
    pub index: usize,
    pub synthesis: SynthesisState,
    pub transcode: TranscodeState,
    pub lipsync: LipsyncState,
}

impl UtteranceReport {
    fn pending(index: usize) -> Self {
        Self {
            index,
            synthesis: SynthesisState::Skipped,
            transcode: TranscodeState::Skipped,
            lipsync: LipsyncState::Skipped,
        }
    }
}

enum SynthesisOutcome {
    Skipped,
    Audio(Vec<u8>),
    Failed,
}

struct LipsyncOutcome {
    transcode: TranscodeState,
    lipsync: LipsyncState,
    cues: Vec<MouthCue>,
}

impl LipsyncOutcome {
    fn failed(transcode: TranscodeState) -> Self {
        Self {
            transcode,
            lipsync: LipsyncState::Failed,
            cues: Vec::new(),
        }
    }
}

pub struct SpeechPipeline {
    config: PipelineConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcoder: Arc<dyn Transcoder>,
    extractor: Arc<dyn VisemeExtractor>,
    workspace: Arc<TempWorkspace>,
}

impl SpeechPipeline {
    pub fn new(
        config: PipelineConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcoder: Arc<dyn Transcoder>,
        extractor: Arc<dyn VisemeExtractor>,
        workspace: Arc<TempWorkspace>,
    ) -> Self {
        Self {
            config,
            synthesizer,
            transcoder,
            extractor,
            workspace,
        }
    }

    /// Production wiring: HTTP speech service, ffmpeg and Rhubarb.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let synthesizer = Arc::new(HttpSynthesizer::new(config.synthesis.clone())?);
        let resolver = Arc::new(
            BinaryResolver::new(
                "ffmpeg",
                config.ffmpeg_path.clone(),
                config.ffmpeg_candidates.clone(),
            )
            .with_probe_args(&["-version"])
            .with_probe_timeout(config.probe_timeout),
        );
        let transcoder = Arc::new(FfmpegTranscoder::new(resolver, config.process_timeout));
        let extractor = Arc::new(RhubarbExtractor::new(
            config.rhubarb_path.clone(),
            config.cue_timings,
            config.process_timeout,
        ));
        let workspace = Arc::new(TempWorkspace::new(config.temp_root.clone()));
        Ok(Self::new(config, synthesizer, transcoder, extractor, workspace))
    }

    pub fn workspace(&self) -> Arc<TempWorkspace> {
        Arc::clone(&self.workspace)
    }

    /// Render the raw AI reply. A payload that does not parse as an
    /// utterance list comes back unchanged as [`RenderedReply::Raw`].
    pub async fn render(
        &self,
        raw_reply: &str,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RenderedReply, PipelineError> {
        let Some(utterances) = parse_reply(raw_reply) else {
            log::warn!("AI reply does not match the utterance schema; returning it unchanged");
            return Ok(RenderedReply::Raw(raw_reply.to_string()));
        };
        let (enriched, _) = self
            .render_utterances(utterances, conversation_id, cancel)
            .await?;
        Ok(RenderedReply::Enriched(enriched))
    }

    /// Enrich every utterance with audio and mouth cues, in input order.
    pub async fn render_utterances(
        &self,
        utterances: Vec<Utterance>,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<EnrichedUtterance>, Vec<UtteranceReport>), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let started = Instant::now();
        let count = utterances.len();
        let mut reports: Vec<UtteranceReport> = (0..count).map(UtteranceReport::pending).collect();
        let mut audio = vec![String::new(); count];
        let mut cues: Vec<Vec<MouthCue>> = vec![Vec::new(); count];

        let synthesized = self.synthesize_all(&utterances, cancel).await?;
        let mut with_audio = Vec::new();
        for (index, outcome) in synthesized.into_iter().enumerate() {
            reports[index].synthesis = match outcome {
                SynthesisOutcome::Skipped => SynthesisState::Skipped,
                SynthesisOutcome::Failed => SynthesisState::Failed,
                SynthesisOutcome::Audio(bytes) => {
                    audio[index] = encode_audio(&bytes);
                    with_audio.push((index, bytes));
                    SynthesisState::Synthesized
                }
            };
        }

        let lipsync = self
            .lipsync_all(count, with_audio, conversation_id, cancel)
            .await?;
        for (index, outcome) in lipsync {
            reports[index].transcode = outcome.transcode;
            reports[index].lipsync = outcome.lipsync;
            cues[index] = outcome.cues;
        }

        let enriched = utterances
            .into_iter()
            .zip(audio)
            .zip(cues)
            .map(|((utterance, audio), cues)| assemble(utterance, audio, cues))
            .collect();

        for report in &reports {
            log::debug!("{report:?}");
        }
        log::info!(
            "Rendered {count} utterances for conversation {conversation_id} in {:?}",
            started.elapsed()
        );
        Ok((enriched, reports))
    }

    async fn synthesize_all(
        &self,
        utterances: &[Utterance],
        cancel: &CancellationToken,
    ) -> Result<Vec<SynthesisOutcome>, PipelineError> {
        let mut slots: Vec<Option<SynthesisOutcome>> = Vec::with_capacity(utterances.len());
        let mut tasks = JoinSet::new();

        for (index, utterance) in utterances.iter().enumerate() {
            if !self.config.include_audio {
                slots.push(Some(SynthesisOutcome::Skipped));
                continue;
            }
            let spoken = sanitize(utterance.text());
            if is_blank(&spoken) {
                log::info!("Utterance {index} has nothing speakable, skipping synthesis");
                slots.push(Some(SynthesisOutcome::Skipped));
                continue;
            }
            slots.push(None);

            let spoken = truncate_for_synthesis(&spoken, self.config.synthesis.max_chars);
            let synthesizer = Arc::clone(&self.synthesizer);
            tasks.spawn(async move {
                let outcome = match synthesizer.synthesize(&spoken).await {
                    Ok(bytes) if bytes.is_empty() => {
                        log::warn!("Utterance {index}: speech service returned no audio");
                        SynthesisOutcome::Failed
                    }
                    Ok(bytes) => SynthesisOutcome::Audio(bytes),
                    Err(e) => {
                        log::warn!("Utterance {index}: synthesis failed, continuing without audio: {e:#}");
                        SynthesisOutcome::Failed
                    }
                };
                (index, outcome)
            });
        }

        join_phase(&mut tasks, &mut slots, cancel, "synthesis").await?;
        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(SynthesisOutcome::Failed))
            .collect())
    }

    async fn lipsync_all(
        &self,
        count: usize,
        with_audio: Vec<(usize, Vec<u8>)>,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, LipsyncOutcome)>, PipelineError> {
        if with_audio.is_empty() {
            return Ok(Vec::new());
        }

        let dir = match self.workspace.conversation_dir(conversation_id).await {
            Ok(dir) => dir,
            Err(e) => {
                log::error!("No scratch dir for conversation {conversation_id}: {e:#}");
                return Ok(with_audio
                    .into_iter()
                    .map(|(index, _)| (index, LipsyncOutcome::failed(TranscodeState::Skipped)))
                    .collect());
            }
        };

        let indices: Vec<usize> = with_audio.iter().map(|(index, _)| *index).collect();
        let mut slots: Vec<Option<LipsyncOutcome>> = (0..count).map(|_| None).collect();
        let mut tasks = JoinSet::new();
        for (index, bytes) in with_audio {
            let transcoder = Arc::clone(&self.transcoder);
            let extractor = Arc::clone(&self.extractor);
            let dir: PathBuf = dir.clone();
            tasks.spawn(async move {
                let outcome =
                    render_lipsync(index, &bytes, &dir, transcoder.as_ref(), extractor.as_ref())
                        .await;
                (index, outcome)
            });
        }

        join_phase(&mut tasks, &mut slots, cancel, "lipsync").await?;
        Ok(indices
            .into_iter()
            .map(|index| {
                let outcome = slots[index]
                    .take()
                    .unwrap_or_else(|| LipsyncOutcome::failed(TranscodeState::Skipped));
                (index, outcome)
            })
            .collect())
    }
}

/// Write one utterance's audio to disk, convert it and extract cues. Every
/// file created here is gone when this returns or is dropped.
async fn render_lipsync(
    index: usize,
    audio: &[u8],
    dir: &Path,
    transcoder: &dyn Transcoder,
    extractor: &dyn VisemeExtractor,
) -> LipsyncOutcome {
    let source = match stage_file(dir, "utterance-", ".mp3", audio).await {
        Ok(path) => path,
        Err(e) => {
            log::error!("Utterance {index}: cannot stage audio for lipsync: {e:#}");
            return LipsyncOutcome::failed(TranscodeState::Skipped);
        }
    };

    let converted = transcoder.to_extractor_format(&source).await;
    let (transcode, converted_file) = if converted.as_path() == &*source {
        (TranscodeState::Fallback, None)
    } else {
        (TranscodeState::Transcoded, Some(TempPath::from_path(converted.clone())))
    };

    let generated = extractor.generate(&converted).await;

    if let Some(file) = converted_file {
        discard(file);
    }
    discard(source);

    match generated {
        Some(cues) => LipsyncOutcome {
            transcode,
            lipsync: LipsyncState::Generated,
            cues,
        },
        None => {
            log::warn!("Utterance {index}: no lipsync data, continuing without it");
            LipsyncOutcome::failed(transcode)
        }
    }
}

/// Join every task of a phase into `slots` by index. A task that panics
/// leaves its slot empty. On cancellation the remaining tasks are aborted
/// and awaited so their guards have run before this returns.
async fn join_phase<T: Send + 'static>(
    tasks: &mut JoinSet<(usize, T)>,
    slots: &mut [Option<T>],
    cancel: &CancellationToken,
    phase: &str,
) -> Result<(), PipelineError> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Cancelling {phase} phase with {} tasks in flight", tasks.len());
                tasks.shutdown().await;
                return Err(PipelineError::Cancelled);
            }
            joined = tasks.join_next() => match joined {
                None => return Ok(()),
                Some(Ok((index, value))) => slots[index] = Some(value),
                Some(Err(e)) => log::error!("{phase} task failed: {e}"),
            }
        }
    }
}
