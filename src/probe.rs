//! Locating and running external helper binaries.
//!
//! The service depends on ffmpeg being installed somewhere sensible, but
//! "somewhere" differs between a developer laptop, a Homebrew install and a
//! slim container. [`BinaryResolver`] tries a configured override first and
//! then a list of conventional locations, running each candidate with a
//! version flag and accepting the first that exits cleanly. The answer is
//! cached for the lifetime of the process.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use wait_timeout::ChildExt;

pub struct BinaryResolver {
    name: String,
    override_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    probe_args: Vec<String>,
    probe_timeout: Duration,
    resolved: OnceCell<Option<PathBuf>>,
}

impl BinaryResolver {
    pub fn new(name: &str, override_path: Option<PathBuf>, candidates: Vec<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            override_path,
            candidates,
            probe_args: vec!["-version".to_string()],
            probe_timeout: Duration::from_secs(5),
            resolved: OnceCell::new(),
        }
    }

    pub fn with_probe_args(mut self, args: &[&str]) -> Self {
        self.probe_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Return the first working candidate, probing only on the first call.
    /// Blocks while probing; async code should use [`Self::resolve_async`].
    pub fn resolve(&self) -> Option<PathBuf> {
        self.resolved
            .get_or_init(|| {
                let found = self
                    .override_path
                    .iter()
                    .chain(self.candidates.iter())
                    .find(|candidate| self.probe(candidate))
                    .cloned();
                match &found {
                    Some(path) => log::info!("Using {} binary: {}", self.name, path.display()),
                    None => log::warn!(
                        "No working {} binary found (override: {:?}, {} candidates)",
                        self.name,
                        self.override_path,
                        self.candidates.len()
                    ),
                }
                found
            })
            .clone()
    }

    /// Resolve on the blocking pool so probes never stall the executor.
    pub async fn resolve_async(self: &Arc<Self>) -> Option<PathBuf> {
        if let Some(cached) = self.resolved.get() {
            return cached.clone();
        }
        let this = Arc::clone(self);
        match tokio::task::spawn_blocking(move || this.resolve()).await {
            Ok(found) => found,
            Err(e) => {
                log::error!("{} probe task failed: {e}", self.name);
                None
            }
        }
    }

    /// Run the candidate with the probe arguments and report whether it
    /// exited successfully in time. Hung probes are killed and reaped.
    fn probe(&self, candidate: &Path) -> bool {
        let mut child = match Command::new(candidate)
            .args(&self.probe_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                log::debug!("{} candidate {} unusable: {e}", self.name, candidate.display());
                return false;
            }
        };
        match child.wait_timeout(self.probe_timeout) {
            Ok(Some(status)) => status.success(),
            Ok(None) => {
                log::warn!("{} candidate {} timed out", self.name, candidate.display());
                let _ = child.kill();
                let _ = child.wait();
                false
            }
            Err(e) => {
                log::debug!("Failed to wait on {}: {e}", candidate.display());
                let _ = child.kill();
                let _ = child.wait();
                false
            }
        }
    }
}

/// Run an external command to completion with captured stdout/stderr.
/// The child is killed if the timeout elapses or the future is dropped,
/// so no process outlives its caller.
pub async fn run_with_timeout(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<Output> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow!("{program} timed out after {timeout:?}"))?
        .with_context(|| format!("failed to run {program}"))
}

/// Trimmed stderr for log lines.
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
