use thiserror::Error;

/// Failures that escape a pipeline run. Everything else is absorbed per
/// utterance and shows up as missing audio or lip-sync.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("speech rendering was cancelled")]
    Cancelled,
}
