//! Batch video to GIF/PNG/MP4 conversion on top of ffmpeg and gifsicle.

pub mod batch;
pub mod converter;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod error;
pub mod ffmpeg;
pub mod filters;
pub mod logging;
pub mod probe;
pub mod progress;
pub mod settings;
pub mod thumbnail;

pub use batch::{BatchEvent, BatchOrchestrator, BatchStatus, BatchSummary, EventSink};
pub use converter::{JobOutcome, JobRequest, JobRunner, JobStage};
pub use error::{JobError, ProcessError, SettingsError, ThumbnailError};
pub use ffmpeg::{ExecutablePaths, Invocation, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use probe::VideoInfo;
pub use settings::ConversionSettings;
