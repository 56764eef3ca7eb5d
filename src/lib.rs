//! Speech and lip-sync rendering for a virtual companion's replies.
//!
//! The chat model answers with a short list of utterances. For each one
//! this crate produces synthesized speech (base64 MP3) and a mouth-shape
//! timeline, then hands the reply back with every original field intact
//! plus `audioBase64` and `lipsync`. Audio and lip-sync are best-effort:
//! a failure only empties the affected utterance's enrichment.
//!
//! Entry point: [`SpeechPipeline::render`].

pub mod config;
pub mod error;
pub mod lipsync;
pub mod pipeline;
pub mod probe;
pub mod reply;
pub mod sanitize;
pub mod synthesis;
pub mod transcode;
pub mod workspace;

#[cfg(all(test, unix))]
mod testing;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use lipsync::{CueTimings, MouthCue, Viseme, VisemeExtractor};
pub use pipeline::{LipsyncState, SpeechPipeline, SynthesisState, TranscodeState, UtteranceReport};
pub use reply::{EnrichedUtterance, RenderedReply, Utterance};
pub use synthesis::SpeechSynthesizer;
pub use transcode::Transcoder;
pub use workspace::{spawn_sweeper, TempWorkspace};
