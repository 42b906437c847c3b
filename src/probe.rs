use crate::error::ProcessError;
use crate::ffmpeg::{ExecutablePaths, Invocation, ProcessRunner};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Seconds
    pub duration: f64,
}

/// Substituted whenever probing fails, so callers always get dimensions.
pub const FALLBACK_VIDEO_INFO: VideoInfo = VideoInfo {
    width: 1280,
    height: 720,
    duration: 10.0,
};

impl Default for VideoInfo {
    fn default() -> Self {
        FALLBACK_VIDEO_INFO
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn probe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "v:0".into(),
        "-show_entries".into(),
        "stream=width,height,duration:format=duration".into(),
        "-of".into(),
        "json".into(),
        input.to_string_lossy().into_owned(),
    ]
}

/// What ffprobe actually reported, before any fallback is filled in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbedVideo {
    pub width: u32,
    pub height: u32,
    /// None when neither the stream nor the container carries a duration
    pub duration: Option<f64>,
}

impl ProbedVideo {
    pub fn info(&self) -> VideoInfo {
        VideoInfo {
            width: self.width,
            height: self.height,
            duration: self.duration.unwrap_or(FALLBACK_VIDEO_INFO.duration),
        }
    }
}

/// Reads the first video stream's size and duration from ffprobe's JSON.
/// Stream duration wins over container duration.
pub fn parse_probe_json(stdout: &str) -> Option<ProbedVideo> {
    let parsed: ProbeOutput = serde_json::from_str(stdout).ok()?;
    let stream = parsed.streams.first()?;

    let width = stream.width.filter(|w| *w > 0)?;
    let height = stream.height.filter(|h| *h > 0)?;

    let seconds = |s: &Option<String>| {
        s.as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
    };
    let duration = seconds(&stream.duration)
        .or_else(|| parsed.format.as_ref().and_then(|f| seconds(&f.duration)));

    Some(ProbedVideo {
        width,
        height,
        duration,
    })
}

/// Like `parse_probe_json`, with a missing duration replaced by the
/// fallback while keeping the probed size.
pub fn parse_probe_output(stdout: &str) -> Option<VideoInfo> {
    parse_probe_json(stdout).map(|probed| probed.info())
}

/// Probes `input` once, killing ffprobe if `cancel` fires. `None` means
/// nothing usable came back (including cancellation); the reason is logged.
pub async fn probe_source<R: ProcessRunner>(
    runner: &R,
    paths: &ExecutablePaths,
    input: &Path,
    cancel: &CancellationToken,
) -> Option<ProbedVideo> {
    let invocation = Invocation::new(paths.ffprobe.clone(), probe_args(input));

    let output = match runner.run(&invocation, cancel, &mut |_line: &str| {}).await {
        Ok(output) => output,
        Err(ProcessError::Cancelled) => {
            debug!(file = %input.display(), "probe cancelled");
            return None;
        }
        Err(e) => {
            warn!(file = %input.display(), error = %e, "ffprobe could not run");
            return None;
        }
    };

    if !output.success() {
        warn!(
            file = %input.display(),
            code = ?output.code,
            stderr = %output.stderr.trim(),
            "ffprobe failed"
        );
        return None;
    }

    let probed = parse_probe_json(&output.stdout);
    match probed {
        Some(probed) => debug!(file = %input.display(), ?probed, "probed"),
        None => warn!(file = %input.display(), "no video stream in ffprobe output"),
    }
    probed
}

/// Probes `input` once. Never fails: any problem yields `FALLBACK_VIDEO_INFO`.
pub async fn probe<R: ProcessRunner>(runner: &R, paths: &ExecutablePaths, input: &Path) -> VideoInfo {
    match probe_source(runner, paths, input, &CancellationToken::new()).await {
        Some(probed) => probed.info(),
        None => {
            warn!(file = %input.display(), "using fallback dimensions");
            FALLBACK_VIDEO_INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::TokioProcessRunner;

    #[test]
    fn parses_stream_fields() {
        let json = r#"{
            "programs": [],
            "streams": [ { "width": 1920, "height": 1080, "duration": "12.345000" } ],
            "format": { "duration": "12.400000" }
        }"#;
        assert_eq!(
            parse_probe_output(json),
            Some(VideoInfo { width: 1920, height: 1080, duration: 12.345 })
        );
    }

    #[test]
    fn container_duration_fills_in() {
        let json = r#"{ "streams": [ { "width": 640, "height": 480 } ], "format": { "duration": "3.5" } }"#;
        assert_eq!(parse_probe_output(json).unwrap().duration, 3.5);

        let json = r#"{ "streams": [ { "width": 640, "height": 480, "duration": "N/A" } ] }"#;
        assert_eq!(parse_probe_output(json).unwrap().duration, 10.0);
        assert_eq!(
            parse_probe_json(json),
            Some(ProbedVideo { width: 640, height: 480, duration: None })
        );
    }

    #[test]
    fn rejects_missing_stream_or_garbage() {
        assert_eq!(parse_probe_output(r#"{ "streams": [] }"#), None);
        assert_eq!(parse_probe_output(r#"{ "streams": [ { "width": 0, "height": 10 } ] }"#), None);
        assert_eq!(parse_probe_output("1920,1080,10.0"), None);
        assert_eq!(parse_probe_output(""), None);
    }

    #[tokio::test]
    async fn nonexistent_input_gives_fallback() {
        let paths = ExecutablePaths::resolve(None);
        let info = probe(&TokioProcessRunner, &paths, Path::new("/no/such/dir/clip.mp4")).await;
        assert_eq!(info, FALLBACK_VIDEO_INFO);
    }

    #[tokio::test]
    async fn missing_prober_gives_fallback() {
        let mut paths = ExecutablePaths::from_path();
        paths.ffprobe = "/no/such/ffprobe".into();
        let info = probe(&TokioProcessRunner, &paths, Path::new("clip.mp4")).await;
        assert_eq!(info, FALLBACK_VIDEO_INFO);
    }
}
