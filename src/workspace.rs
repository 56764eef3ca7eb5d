//! Scratch file management for pipeline runs.
//!
//! Audio handed to ffmpeg and Rhubarb has to live on disk. Every run writes
//! into a per-conversation subdirectory of one process-wide scratch root.
//! Files a run creates are held as [`TempPath`]s so they are removed on
//! every exit path, cancellation included. A periodic sweep
//! ([`spawn_sweeper`]) catches anything that still leaks.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tempfile::TempPath;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owner of the scratch root directory.
pub struct TempWorkspace {
    root: PathBuf,
    created: OnceCell<()>,
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub errors: usize,
}

impl TempWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the scratch root on first use. Concurrent first callers block
    /// on the same initialisation; a failed attempt is retried next time.
    pub fn ensure_root_dir(&self) -> Result<&Path> {
        self.created.get_or_try_init(|| {
            std::fs::create_dir_all(&self.root).with_context(|| {
                format!("failed to create scratch root {}", self.root.display())
            })?;
            log::info!("Scratch root ready at {}", self.root.display());
            Ok::<(), anyhow::Error>(())
        })?;
        Ok(&self.root)
    }

    /// Per-conversation subdirectory, created on demand.
    pub async fn conversation_dir(&self, conversation_id: &str) -> Result<PathBuf> {
        let dir = self.ensure_root_dir()?.join(safe_dir_name(conversation_id));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create conversation dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Delete files last modified before `now - max_age`, then remove the
    /// conversation directories left empty. Never fails: every problem is
    /// logged and counted so one bad entry cannot abort the sweep.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return report;
        };

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
            Err(e) => {
                log::warn!("Cannot list scratch root {}: {e}", self.root.display());
                report.errors += 1;
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Error while listing {}: {e}", self.root.display());
                    report.errors += 1;
                    break;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Cannot stat {}: {e}", path.display());
                    report.errors += 1;
                    continue;
                }
            };

            if file_type.is_dir() {
                let removed = sweep_dir(&path, cutoff, &mut report).await;
                if removed > 0 || modified_before(&path, cutoff).await {
                    remove_if_empty(&path, &mut report).await;
                }
            } else if modified_before(&path, cutoff).await {
                remove_stale_file(&path, &mut report).await;
            }
        }

        if report.files_removed > 0 || report.dirs_removed > 0 || report.errors > 0 {
            log::info!(
                "Scratch sweep removed {} files and {} dirs ({} errors)",
                report.files_removed,
                report.dirs_removed,
                report.errors
            );
        }
        report
    }
}

/// Remove stale files directly inside `dir`. Returns how many were removed.
async fn sweep_dir(dir: &Path, cutoff: SystemTime, report: &mut SweepReport) -> usize {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot list {}: {e}", dir.display());
            report.errors += 1;
            return 0;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                if path.is_file() && modified_before(&path, cutoff).await {
                    let before = report.files_removed;
                    remove_stale_file(&path, report).await;
                    removed += report.files_removed - before;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Error while listing {}: {e}", dir.display());
                report.errors += 1;
                break;
            }
        }
    }
    removed
}

async fn modified_before(path: &Path, cutoff: SystemTime) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified < cutoff,
        Err(e) => {
            log::debug!("No modification time for {}: {e}", path.display());
            false
        }
    }
}

async fn remove_stale_file(path: &Path, report: &mut SweepReport) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            log::debug!("Removed stale scratch file {}", path.display());
            report.files_removed += 1;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            log::warn!("Failed to remove stale file {}: {e}", path.display());
            report.errors += 1;
        }
    }
}

async fn remove_if_empty(dir: &Path, report: &mut SweepReport) {
    let empty = match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    };
    if !empty {
        return;
    }
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => report.dirs_removed += 1,
        // A run may have written into it since we looked.
        Err(e) => log::debug!("Kept conversation dir {}: {e}", dir.display()),
    }
}

/// Map a conversation id onto a single safe path component.
fn safe_dir_name(conversation_id: &str) -> String {
    let name: String = conversation_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "anonymous".to_string()
    } else {
        name
    }
}

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic safety-net cleanup, owned by the process rather than by any
/// request. The first sweep runs immediately.
pub fn spawn_sweeper(
    workspace: Arc<TempWorkspace>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        log::warn!("Zero sweep interval, sweeping every {MIN_SWEEP_INTERVAL:?} instead");
        MIN_SWEEP_INTERVAL
    } else {
        interval
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Scratch sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    workspace.cleanup_older_than(max_age).await;
                }
            }
        }
    })
}

/// Write `bytes` to a fresh, exclusively created file inside `dir`. The
/// returned path deletes the file when dropped.
pub async fn stage_file(dir: &Path, prefix: &str, suffix: &str, bytes: &[u8]) -> Result<TempPath> {
    // The sweeper may have removed an empty directory in the meantime.
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .with_context(|| format!("failed to create scratch file in {}", dir.display()))?
        .into_temp_path();
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Delete a scratch file now, logging instead of failing.
pub fn discard(path: TempPath) {
    let shown = path.to_path_buf();
    match path.close() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to delete scratch file {}: {e}", shown.display()),
    }
}
