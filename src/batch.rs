//! Sequential batch conversion with event reporting.
//!
//! One file runs at a time. A failed file is reported and the batch moves
//! on; a cancellation kills the running encoder and drops the rest of the
//! queue.

use crate::converter::{output_path_for, JobRequest, JobRunner};
use crate::error::JobError;
use crate::ffmpeg::{ExecutablePaths, ProcessRunner};
use crate::settings::ConversionSettings;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BatchEvent {
    BatchStart {
        total_files: usize,
    },
    FileStart {
        index: usize,
        total: usize,
        file_name: String,
    },
    FileProgress {
        index: usize,
        total: usize,
        percent: u8,
    },
    FileCompleted {
        index: usize,
        output_path: PathBuf,
        optimized: bool,
    },
    FileError {
        index: usize,
        message: String,
    },
    BatchCancelled,
    BatchComplete {
        succeeded: usize,
        failed: usize,
    },
    /// The batch was refused before any file was touched
    BatchError {
        message: String,
    },
}

impl BatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::BatchStart { .. } => "batch-start",
            BatchEvent::FileStart { .. } => "file-start",
            BatchEvent::FileProgress { .. } => "file-progress",
            BatchEvent::FileCompleted { .. } => "file-completed",
            BatchEvent::FileError { .. } => "file-error",
            BatchEvent::BatchCancelled => "batch-cancelled",
            BatchEvent::BatchComplete { .. } => "batch-complete",
            BatchEvent::BatchError { .. } => "batch-error",
        }
    }
}

/// Receives batch events as they happen. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: BatchEvent);
}

impl<F> EventSink for F
where
    F: Fn(BatchEvent) + Send + Sync,
{
    fn emit(&self, event: BatchEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum BatchStatus {
    Completed,
    Cancelled,
    /// The caller declined to overwrite existing outputs
    Declined,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub status: BatchStatus,
}

impl BatchSummary {
    fn new(total: usize, status: BatchStatus) -> Self {
        Self {
            total,
            succeeded: 0,
            failed: 0,
            status,
        }
    }
}

/// Turns source paths into job requests. Sources that would land on the
/// same output name get a numeric suffix so no file is written twice.
pub fn plan_jobs(files: &[PathBuf], settings: &ConversionSettings) -> Vec<JobRequest> {
    let mut taken: HashSet<PathBuf> = HashSet::new();
    files
        .iter()
        .map(|source| {
            let mut request = JobRequest::new(source.clone(), settings);
            let mut n = 2;
            while taken.contains(&request.output_path) {
                request.output_path = with_suffix(&output_path_for(source, settings), n);
                n += 1;
            }
            taken.insert(request.output_path.clone());
            request
        })
        .collect()
}

fn with_suffix(path: &Path, n: usize) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{n}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{n}"),
    };
    path.with_file_name(name)
}

/// Outputs of the planned batch that already exist on disk.
pub fn find_conflicts(files: &[PathBuf], settings: &ConversionSettings) -> Vec<PathBuf> {
    plan_jobs(files, settings)
        .into_iter()
        .map(|job| job.output_path)
        .filter(|path| path.exists())
        .collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the encoders and the cancellation token of the batch in flight.
pub struct BatchOrchestrator<R> {
    runner: R,
    paths: ExecutablePaths,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl<R: ProcessRunner> BatchOrchestrator<R> {
    pub fn new(runner: R, paths: ExecutablePaths) -> Self {
        Self {
            runner,
            paths,
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn paths(&self) -> &ExecutablePaths {
        &self.paths
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the running batch: the current encoder is killed and no
    /// further file starts. Repeated calls are no-ops.
    pub fn cancel(&self) {
        // Held across the check so a batch starting now can't swap in a fresh token unseen
        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() && !token.is_cancelled() {
            info!("batch cancellation requested");
            token.cancel();
        }
    }

    fn reject<S: EventSink + ?Sized>(&self, sink: &S, total: usize, reason: String) -> BatchSummary {
        error!(%reason, "batch rejected");
        sink.emit(BatchEvent::BatchError {
            message: reason.clone(),
        });
        BatchSummary::new(total, BatchStatus::Rejected(reason))
    }

    /// Converts `files` in order. If some outputs already exist,
    /// `confirm_overwrite` is asked once with their paths before anything
    /// is touched; `false` ends the batch as `Declined`.
    ///
    /// Never fails: per-file problems are `file-error` events, pre-flight
    /// problems a `batch-error` event, and both are reflected in the summary.
    pub async fn run_batch<S, C, Fut>(
        &self,
        files: Vec<PathBuf>,
        settings: &ConversionSettings,
        sink: &S,
        confirm_overwrite: C,
    ) -> BatchSummary
    where
        S: EventSink + ?Sized,
        C: FnOnce(Vec<PathBuf>) -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let total = files.len();

        // The running flag and the token change together, under the token lock
        let token = {
            let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if self.running.swap(true, Ordering::SeqCst) {
                None
            } else {
                *current = CancellationToken::new();
                Some(current.clone())
            }
        };
        let Some(token) = token else {
            return self.reject(sink, total, "A batch is already running".to_string());
        };
        let _running = RunningGuard(&self.running);

        if let Err(e) = settings.validate() {
            return self.reject(sink, total, e.to_string());
        }
        if let Err(e) = tokio::fs::create_dir_all(&settings.output_directory).await {
            return self.reject(
                sink,
                total,
                format!("Cannot create output directory {}: {e}", settings.output_directory.display()),
            );
        }

        let jobs = plan_jobs(&files, settings);
        let conflicts: Vec<PathBuf> = jobs
            .iter()
            .map(|job| job.output_path.clone())
            .filter(|path| path.exists())
            .collect();
        if !conflicts.is_empty() {
            let count = conflicts.len();
            if !confirm_overwrite(conflicts).await {
                info!(existing = count, "overwrite declined, batch not started");
                sink.emit(BatchEvent::BatchCancelled);
                return BatchSummary::new(total, BatchStatus::Declined);
            }
        }

        info!(total, output = %settings.output_directory.display(), "batch started");
        sink.emit(BatchEvent::BatchStart { total_files: total });

        let mut summary = BatchSummary::new(total, BatchStatus::Completed);
        let mut job_runner = JobRunner::new(&self.runner, &self.paths, settings, token.clone());

        for (index, request) in jobs.iter().enumerate() {
            if token.is_cancelled() {
                return self.cancelled(sink, summary);
            }

            sink.emit(BatchEvent::FileStart {
                index,
                total,
                file_name: display_name(&request.source_path),
            });

            let result = job_runner
                .run(request, |percent| {
                    sink.emit(BatchEvent::FileProgress {
                        index,
                        total,
                        percent,
                    })
                })
                .await;

            match result {
                Ok(outcome) => {
                    summary.succeeded += 1;
                    sink.emit(BatchEvent::FileCompleted {
                        index,
                        output_path: outcome.output_path,
                        optimized: outcome.optimized,
                    });
                }
                Err(JobError::Cancelled) => {
                    return self.cancelled(sink, summary);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(index, file = %request.file_id, error = %e, "file failed, continuing");
                    sink.emit(BatchEvent::FileError {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(succeeded = summary.succeeded, failed = summary.failed, "batch complete");
        sink.emit(BatchEvent::BatchComplete {
            succeeded: summary.succeeded,
            failed: summary.failed,
        });
        summary
    }

    fn cancelled<S: EventSink + ?Sized>(&self, sink: &S, mut summary: BatchSummary) -> BatchSummary {
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch cancelled"
        );
        sink.emit(BatchEvent::BatchCancelled);
        summary.status = BatchStatus::Cancelled;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_outputs_get_suffixes() {
        let mut settings = ConversionSettings::default();
        settings.output_directory = PathBuf::from("/out");
        let files = vec![
            PathBuf::from("/a/clip.mp4"),
            PathBuf::from("/b/clip.mov"),
            PathBuf::from("/c/clip.mkv"),
            PathBuf::from("/a/other.mp4"),
        ];
        let outputs: Vec<PathBuf> = plan_jobs(&files, &settings).into_iter().map(|j| j.output_path).collect();
        assert_eq!(
            outputs,
            vec![
                PathBuf::from("/out/clip.gif"),
                PathBuf::from("/out/clip-2.gif"),
                PathBuf::from("/out/clip-3.gif"),
                PathBuf::from("/out/other.gif"),
            ]
        );
    }

    struct NoRunner;

    impl ProcessRunner for NoRunner {
        async fn run(
            &self,
            _invocation: &crate::ffmpeg::Invocation,
            _cancel: &CancellationToken,
            _on_stderr_line: &mut (dyn FnMut(&str) + Send),
        ) -> Result<crate::ffmpeg::ProcessOutput, crate::error::ProcessError> {
            unreachable!("no process expected")
        }
    }

    #[tokio::test]
    async fn cancel_as_batch_starts_reaches_that_batch() {
        let orchestrator = BatchOrchestrator::new(NoRunner, ExecutablePaths::from_path());
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ConversionSettings::default();
        settings.output_directory = dir.path().to_path_buf();

        // Cancelling from inside the overwrite prompt runs after the token
        // swap; the batch must see it and start nothing.
        std::fs::write(dir.path().join("clip.gif"), b"old").unwrap();
        let events = Mutex::new(Vec::new());
        let sink = |e: BatchEvent| events.lock().unwrap().push(e);
        let summary = orchestrator
            .run_batch(vec![PathBuf::from("/in/clip.mp4")], &settings, &sink, |_| {
                orchestrator.cancel();
                async { true }
            })
            .await;

        assert_eq!(summary.status, BatchStatus::Cancelled);
        assert_eq!(
            events.into_inner().unwrap(),
            vec![BatchEvent::BatchStart { total_files: 1 }, BatchEvent::BatchCancelled]
        );
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn events_serialize_with_ui_names() {
        let event = BatchEvent::FileProgress {
            index: 1,
            total: 3,
            percent: 40,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "event": "file-progress", "index": 1, "total": 3, "percent": 40 })
        );
        assert_eq!(
            serde_json::to_value(BatchEvent::BatchStart { total_files: 2 }).unwrap(),
            serde_json::json!({ "event": "batch-start", "totalFiles": 2 })
        );
        assert_eq!(
            serde_json::to_value(BatchEvent::BatchCancelled).unwrap(),
            serde_json::json!({ "event": "batch-cancelled" })
        );
        assert_eq!(BatchEvent::BatchCancelled.name(), "batch-cancelled");
    }
}
