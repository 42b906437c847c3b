use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Frame rate must be a positive integer")]
    FrameRate,

    #[error("Scale must look like W:H (got {0:?})")]
    Scale(String),

    #[error("Optimization level must be between 1 and 3 (got {0})")]
    OptimizationLevel(u8),

    #[error("Lossy level must be between 0 and 300 (got {0})")]
    Lossy(u16),

    #[error("Color count must be between 2 and 256 (got {0})")]
    ColorCount(u16),

    #[error("Custom palette needs at least one #RRGGBB color (bad entry: {0:?})")]
    CustomPalette(String),

    #[error("Output directory is not set")]
    OutputDirectory,
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn is_missing_executable(&self) -> bool {
        matches!(self, ProcessError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Terminal failure of a single file. Only these escape the job runner;
/// probe and crop problems are absorbed before they get here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid crop dimensions. Try a different crop area")]
    InvalidCrop,

    #[error("Input file not found: {0}")]
    InputNotFound(String),

    #[error("Permission denied. Check that the output folder is writable")]
    PermissionDenied,

    #[error("Encoder not found: {0}. Install it or set its path")]
    ExecutableMissing(String),

    #[error("Conversion failed: {0}")]
    Transcode(String),

    #[error("GIF optimization failed: {0}")]
    Optimize(String),

    #[error("Could not prepare output: {0}")]
    Output(String),

    #[error("Conversion cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("Failed to run ffmpeg: {0}")]
    Process(#[from] ProcessError),

    #[error("Failed to extract frame: {0}")]
    Extract(String),

    #[error("Failed to read frame: {0}")]
    Io(#[from] std::io::Error),
}
