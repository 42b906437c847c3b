use crate::error::{JobError, ProcessError};
use crate::ffmpeg::{ExecutablePaths, Invocation, ProcessRunner};
use crate::filters::{compose, needs_palette_input, palette_image, resolve_crop, CropRect};
use crate::probe::{probe_source, ProbedVideo};
use crate::progress::ProgressTracker;
use crate::settings::{ConversionSettings, OptimizeSettings, OutputFormat, PaletteType};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PNG_FRAME_PATTERN: &str = "frame_%04d.png";
const MAX_ERROR_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Pending,
    Cropping,
    Transcoding,
    Optimizing,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Key into the per-file settings (crop, overlays)
    pub file_id: String,
    pub source_path: PathBuf,
    /// The GIF/MP4 file, or the frames directory for PNG sequences
    pub output_path: PathBuf,
}

impl JobRequest {
    pub fn new(source: impl Into<PathBuf>, settings: &ConversionSettings) -> Self {
        let source_path = source.into();
        Self {
            file_id: source_path.to_string_lossy().into_owned(),
            output_path: output_path_for(&source_path, settings),
            source_path,
        }
    }
}

/// `<outdir>/<stem>.gif`, `<outdir>/<stem>.mp4` or `<outdir>/<stem>_frames`.
pub fn output_path_for(source: &Path, settings: &ConversionSettings) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    match settings.output_format.extension() {
        Some(ext) => settings.output_directory.join(format!("{stem}.{ext}")),
        None => settings.output_directory.join(format!("{stem}_frames")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub output_path: PathBuf,
    /// False when the optimizer failed and the unoptimized GIF was kept
    pub optimized: bool,
    pub crop: Option<CropRect>,
    pub source_dimensions: Option<(u32, u32)>,
}

/// Builds the transcoder argument list. Trim start is split into a fast
/// keyframe seek before the input and an accurate seek after it.
pub fn transcode_args(
    settings: &ConversionSettings,
    request: &JobRequest,
    filter_graph: &str,
    palette: Option<&Path>,
) -> Vec<String> {
    let t = &settings.transcode;
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

    let (fast_seek, accurate_seek) = match t.start_time.filter(|s| *s > 0.0) {
        Some(start) => {
            let fast = start.floor();
            let accurate = start - fast;
            (
                (fast > 0.0).then(|| format!("{:.0}", fast)),
                (accurate > 0.001).then(|| format!("{:.3}", accurate)),
            )
        }
        None => (None, None),
    };

    if let Some(fast) = fast_seek {
        args.extend(["-ss".into(), fast]);
    }
    args.extend(["-i".into(), request.source_path.to_string_lossy().into_owned()]);
    if let Some(palette) = palette {
        args.extend(["-i".into(), palette.to_string_lossy().into_owned()]);
    }
    if let Some(accurate) = accurate_seek {
        args.extend(["-ss".into(), accurate]);
    }
    if let Some(duration) = t.duration.filter(|d| *d > 0.0) {
        args.extend(["-t".into(), format!("{:.3}", duration)]);
    }

    let filter_flag = if palette.is_some() { "-filter_complex" } else { "-vf" };
    args.extend([filter_flag.into(), filter_graph.to_string()]);

    let output = match settings.output_format {
        OutputFormat::Gif => {
            let o = &settings.optimize;
            let loop_value = if o.loop_enabled { o.loop_count as i64 } else { -1 };
            args.extend([
                "-loop".into(),
                loop_value.to_string(),
                "-an".into(),
                "-f".into(),
                "gif".into(),
            ]);
            request.output_path.clone()
        }
        OutputFormat::PngSequence => {
            args.extend(["-an".into(), "-f".into(), "image2".into()]);
            request.output_path.join(PNG_FRAME_PATTERN)
        }
        OutputFormat::Video => {
            args.extend(
                [
                    "-c:v", "libx264", "-preset", "medium", "-pix_fmt", "yuv420p", "-c:a", "aac",
                    "-b:a", "128k", "-movflags", "+faststart",
                ]
                .map(String::from),
            );
            request.output_path.clone()
        }
    };
    args.push(output.to_string_lossy().into_owned());
    args
}

/// gifsicle flags for `input` -> `output`.
pub fn optimize_args(o: &OptimizeSettings, input: &Path, output: &Path) -> Vec<String> {
    let mut args = vec![format!("-O{}", o.optimization_level.clamp(1, 3))];
    if o.lossy > 0 {
        args.push(format!("--lossy={}", o.lossy.min(300)));
    }
    args.push(format!("--colors={}", o.color_count.clamp(2, 256)));
    if o.interlace {
        args.push("--interlace".into());
    }
    args.push(match (o.loop_enabled, o.loop_count) {
        (false, _) => "--no-loopcount".into(),
        (true, 0) => "--loopcount=forever".into(),
        (true, n) => format!("--loopcount={n}"),
    });
    if let Some(delay) = o.frame_delay {
        args.push(format!("--delay={delay}"));
    }
    match o.palette_type {
        PaletteType::Web => args.push("--use-colormap=web".into()),
        PaletteType::Grayscale => args.push("--use-colormap=gray".into()),
        _ => {}
    }
    args.extend([
        "--no-warnings".into(),
        input.to_string_lossy().into_owned(),
        "-o".into(),
        output.to_string_lossy().into_owned(),
    ]);
    args
}

/// Maps transcoder stderr onto a user-facing error.
pub fn classify_transcode_failure(stderr: &str, source: &Path) -> JobError {
    let lower = stderr.to_lowercase();

    let crop_failed = lower.contains("invalid too big or non positive size")
        || (lower.contains("crop")
            && (lower.contains("invalid argument")
                || lower.contains("error initializing filter")
                || lower.contains("error reinitializing filters")));
    if crop_failed {
        return JobError::InvalidCrop;
    }
    if lower.contains("no such file or directory") || lower.contains("does not exist") {
        return JobError::InputNotFound(source.display().to_string());
    }
    if lower.contains("permission denied") || lower.contains("access is denied") {
        return JobError::PermissionDenied;
    }
    if lower.contains("command not found") || lower.contains("is not recognized as an internal or external command") {
        return JobError::ExecutableMissing("ffmpeg".to_string());
    }
    JobError::Transcode(summarize(stderr))
}

/// Last meaningful stderr line, truncated for display.
fn summarize(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("encoder exited with an error");
    if line.chars().count() > MAX_ERROR_LEN {
        let cut: String = line.chars().take(MAX_ERROR_LEN).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn is_frame_file(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    name.starts_with("frame_") && name.ends_with(".png")
}

fn remove_frames(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if is_frame_file(&path) {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not delete old frame");
            }
        }
    }
}

/// Clears whatever a previous run left at the output path. Failure to
/// delete is logged; the encoder overwrites anyway.
fn prepare_output(path: &Path, format: OutputFormat) -> Result<(), JobError> {
    match format {
        OutputFormat::PngSequence => {
            remove_frames(path);
            fs::create_dir_all(path).map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => JobError::PermissionDenied,
                _ => JobError::Output(format!("{}: {}", path.display(), e)),
            })
        }
        OutputFormat::Gif | OutputFormat::Video => {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "could not delete existing output");
                }
            }
            Ok(())
        }
    }
}

fn remove_partial_output(path: &Path, format: OutputFormat) {
    match format {
        OutputFormat::PngSequence => {
            remove_frames(path);
            match fs::remove_dir(path) {
                Ok(()) => debug!(path = %path.display(), "removed partial frames directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "could not delete frames directory"),
            }
        }
        OutputFormat::Gif | OutputFormat::Video => match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not delete partial output"),
        },
    }
}

fn write_palette(colors: &[String]) -> Result<TempPath, JobError> {
    let bytes = palette_image(colors)
        .ok_or_else(|| JobError::Output("custom palette has no valid colors".to_string()))?;
    let io_err = |e: std::io::Error| JobError::Output(format!("palette file: {e}"));
    let mut file = tempfile::Builder::new()
        .prefix("palette_")
        .suffix(".png")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(file.into_temp_path())
}

/// Drives one file at a time through crop, transcode, optimize and
/// finalize. One runner serves a whole batch so probe results are reused.
pub struct JobRunner<'a, R> {
    runner: &'a R,
    paths: &'a ExecutablePaths,
    settings: &'a ConversionSettings,
    cancel: CancellationToken,
    probe_cache: HashMap<PathBuf, Option<ProbedVideo>>,
    stage: JobStage,
}

impl<'a, R: ProcessRunner> JobRunner<'a, R> {
    pub fn new(
        runner: &'a R,
        paths: &'a ExecutablePaths,
        settings: &'a ConversionSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            paths,
            settings,
            cancel,
            probe_cache: HashMap::new(),
            stage: JobStage::Pending,
        }
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    fn enter(&mut self, request: &JobRequest, stage: JobStage) {
        debug!(file = %request.file_id, ?stage, "job stage");
        self.stage = stage;
    }

    fn check_cancelled(&self, request: &JobRequest) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            remove_partial_output(&request.output_path, self.settings.output_format);
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// `None` when ffprobe failed or was cancelled. Cancelled lookups are
    /// not cached.
    async fn source_info(&mut self, path: &Path) -> Option<ProbedVideo> {
        if let Some(probed) = self.probe_cache.get(path) {
            return *probed;
        }
        let probed = probe_source(self.runner, self.paths, path, &self.cancel).await;
        if !self.cancel.is_cancelled() {
            self.probe_cache.insert(path.to_path_buf(), probed);
        }
        probed
    }

    /// Converts one file, reporting 0-100 through `on_progress`. Progress
    /// never decreases and 100 is reported once, right before success.
    pub async fn run<F>(&mut self, request: &JobRequest, mut on_progress: F) -> Result<JobOutcome, JobError>
    where
        F: FnMut(u8) + Send,
    {
        self.enter(request, JobStage::Pending);
        let result = self.execute(request, &mut on_progress).await;
        let terminal = match &result {
            Ok(_) => JobStage::Done,
            Err(JobError::Cancelled) => JobStage::Cancelled,
            Err(_) => JobStage::Failed,
        };
        self.enter(request, terminal);
        result
    }

    async fn execute(
        &mut self,
        request: &JobRequest,
        on_progress: &mut (dyn FnMut(u8) + Send),
    ) -> Result<JobOutcome, JobError> {
        let format = self.settings.output_format;
        self.check_cancelled(request)?;

        let mut source_info = None;
        let mut crop = None;
        if self.settings.crop_for(&request.file_id).is_some() {
            self.enter(request, JobStage::Cropping);
            source_info = self.source_info(&request.source_path).await;
            match source_info {
                Some(probed) => crop = resolve_crop(self.settings, &request.file_id, &probed.info()),
                None if !self.cancel.is_cancelled() => {
                    warn!(file = %request.file_id, "source size unknown, converting uncropped");
                }
                None => {}
            }
        }
        self.check_cancelled(request)?;

        prepare_output(&request.output_path, format)?;

        // Deleted when this function returns, whatever the outcome
        let palette = if needs_palette_input(self.settings) {
            Some(write_palette(&self.settings.optimize.custom_palette)?)
        } else {
            None
        };

        let graph = compose(self.settings, &request.file_id, crop.as_ref());
        let args = transcode_args(self.settings, request, &graph, palette.as_deref());
        let invocation = Invocation::new(self.paths.ffmpeg.clone(), args);

        self.enter(request, JobStage::Transcoding);
        let start = self.settings.transcode.start_time.unwrap_or(0.0).max(0.0);
        let known_duration = self
            .settings
            .transcode
            .duration
            .filter(|d| *d > 0.0)
            .or_else(|| {
                source_info
                    .and_then(|probed| probed.duration)
                    .map(|d| (d - start).max(0.0))
            });
        let mut tracker = ProgressTracker::new(known_duration, start);

        let result = {
            let mut on_line = |line: &str| {
                if let Some(percent) = tracker.observe(line) {
                    on_progress(percent);
                }
            };
            self.runner.run(&invocation, &self.cancel, &mut on_line).await
        };

        let output = match result {
            Ok(output) => output,
            Err(ProcessError::Cancelled) => {
                remove_partial_output(&request.output_path, format);
                return Err(JobError::Cancelled);
            }
            Err(e) if e.is_missing_executable() => {
                error!(file = %request.file_id, error = %e, "transcoder missing");
                return Err(JobError::ExecutableMissing(self.paths.ffmpeg.display().to_string()));
            }
            Err(e) => {
                remove_partial_output(&request.output_path, format);
                return Err(JobError::Transcode(summarize(&e.to_string())));
            }
        };

        if !output.success() {
            remove_partial_output(&request.output_path, format);
            let err = classify_transcode_failure(&output.stderr, &request.source_path);
            error!(file = %request.file_id, code = ?output.code, error = %err, "transcode failed");
            return Err(err);
        }
        self.check_cancelled(request)?;

        let mut optimized = false;
        if format == OutputFormat::Gif {
            self.enter(request, JobStage::Optimizing);
            optimized = self.optimize(request).await?;
        }

        self.enter(request, JobStage::Finalizing);
        let produced = match format {
            OutputFormat::PngSequence => fs::read_dir(&request.output_path)
                .map(|entries| entries.flatten().any(|e| is_frame_file(&e.path())))
                .unwrap_or(false),
            OutputFormat::Gif | OutputFormat::Video => non_empty_file(&request.output_path),
        };
        if !produced {
            remove_partial_output(&request.output_path, format);
            return Err(JobError::Transcode("encoder produced no output".to_string()));
        }

        if let Some(percent) = tracker.finish() {
            on_progress(percent);
        }
        info!(
            file = %request.file_id,
            output = %request.output_path.display(),
            optimized,
            "converted"
        );

        Ok(JobOutcome {
            output_path: request.output_path.clone(),
            optimized,
            crop,
            source_dimensions: tracker.dimensions(),
        })
    }

    /// Optimizes the GIF into a temp file beside it, then renames it over
    /// the GIF. If that fails but the unoptimized GIF is usable, keeps
    /// it and returns `Ok(false)`.
    async fn optimize(&self, request: &JobRequest) -> Result<bool, JobError> {
        let output = &request.output_path;
        let dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let temp = tempfile::Builder::new()
            .prefix(&format!(".{stem}-"))
            .suffix(".gif")
            .tempfile_in(dir)
            .map_err(|e| JobError::Output(format!("optimizer temp file: {e}")))?
            .into_temp_path();

        let args = optimize_args(&self.settings.optimize, output, &temp);
        let invocation = Invocation::new(self.paths.gifsicle.clone(), args);
        let result = self.runner.run(&invocation, &self.cancel, &mut |_line: &str| {}).await;

        let reason = match result {
            Err(ProcessError::Cancelled) => {
                remove_partial_output(output, OutputFormat::Gif);
                return Err(JobError::Cancelled);
            }
            Ok(o) if o.success() && non_empty_file(&temp) => match temp.persist(output) {
                Ok(()) => return Ok(true),
                Err(e) => format!("could not replace output: {}", e.error),
            },
            Ok(o) => summarize(&o.stderr),
            Err(e) => e.to_string(),
        };

        if non_empty_file(output) {
            warn!(file = %request.file_id, %reason, "optimizer failed, keeping unoptimized GIF");
            Ok(false)
        } else {
            Err(JobError::Optimize(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DitherMode;

    fn request() -> JobRequest {
        let mut settings = ConversionSettings::default();
        settings.output_directory = PathBuf::from("/out");
        JobRequest::new("/videos/clip.mp4", &settings)
    }

    #[test]
    fn output_names_follow_format() {
        let mut settings = ConversionSettings::default();
        settings.output_directory = PathBuf::from("/out");
        let src = Path::new("/videos/holiday.clip.mp4");
        assert_eq!(output_path_for(src, &settings), PathBuf::from("/out/holiday.clip.gif"));
        settings.output_format = OutputFormat::Video;
        assert_eq!(output_path_for(src, &settings), PathBuf::from("/out/holiday.clip.mp4"));
        settings.output_format = OutputFormat::PngSequence;
        assert_eq!(output_path_for(src, &settings), PathBuf::from("/out/holiday.clip_frames"));
    }

    #[test]
    fn gif_args_end_with_output() {
        let settings = ConversionSettings::default();
        let args = transcode_args(&settings, &request(), "fps=15", None);
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-y", "-i", "/videos/clip.mp4", "-vf", "fps=15", "-loop", "0", "-an", "-f",
                "gif", "/out/clip.gif"
            ]
        );
    }

    #[test]
    fn trim_uses_hybrid_seek() {
        let mut settings = ConversionSettings::default();
        settings.transcode.start_time = Some(12.25);
        settings.transcode.duration = Some(3.0);
        let args = transcode_args(&settings, &request(), "fps=15", None);
        let pos = |flag: &str, value: &str| {
            args.windows(2).position(|w| w[0] == flag && w[1] == value).unwrap()
        };
        let input = pos("-i", "/videos/clip.mp4");
        assert!(pos("-ss", "12") < input);
        assert!(pos("-ss", "0.250") > input);
        assert!(pos("-t", "3.000") > input);
    }

    #[test]
    fn palette_input_switches_to_filter_complex() {
        let settings = ConversionSettings::default();
        let args = transcode_args(&settings, &request(), "[0:v]fps=15[x];[x][1:v]paletteuse", Some(Path::new("/tmp/p.png")));
        assert!(args.contains(&"-filter_complex".to_string()));
        let first = args.iter().position(|a| a == "/videos/clip.mp4").unwrap();
        let second = args.iter().position(|a| a == "/tmp/p.png").unwrap();
        assert!(first < second);
    }

    #[test]
    fn png_and_video_outputs() {
        let mut settings = ConversionSettings::default();
        settings.output_directory = PathBuf::from("/out");
        settings.output_format = OutputFormat::PngSequence;
        let req = JobRequest::new("/videos/clip.mp4", &settings);
        let args = transcode_args(&settings, &req, "fps=15", None);
        assert_eq!(args.last().unwrap(), "/out/clip_frames/frame_%04d.png");

        settings.output_format = OutputFormat::Video;
        let req = JobRequest::new("/videos/clip.mp4", &settings);
        let args = transcode_args(&settings, &req, "fps=15", None);
        assert!(args.contains(&"libx264".to_string()));
        assert_eq!(args.last().unwrap(), "/out/clip.mp4");
    }

    #[test]
    fn optimizer_flags() {
        let o = OptimizeSettings {
            optimization_level: 3,
            lossy: 80,
            color_count: 128,
            dither_mode: DitherMode::None,
            interlace: true,
            loop_enabled: true,
            loop_count: 2,
            frame_delay: Some(5),
            palette_type: PaletteType::Web,
            custom_palette: Vec::new(),
        };
        let args = optimize_args(&o, Path::new("in.gif"), Path::new("out.gif"));
        assert_eq!(
            args,
            vec![
                "-O3", "--lossy=80", "--colors=128", "--interlace", "--loopcount=2", "--delay=5",
                "--use-colormap=web", "--no-warnings", "in.gif", "-o", "out.gif"
            ]
        );

        let o = OptimizeSettings { loop_enabled: false, ..OptimizeSettings::default() };
        let args = optimize_args(&o, Path::new("in.gif"), Path::new("out.gif"));
        assert!(args.contains(&"--no-loopcount".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--lossy")));
    }

    #[test]
    fn classifies_known_failures() {
        let src = Path::new("/videos/clip.mp4");
        assert_eq!(
            classify_transcode_failure("[Parsed_crop_0 @ 0x1] Invalid too big or non positive size for width '0' or height '0'", src),
            JobError::InvalidCrop
        );
        assert_eq!(
            classify_transcode_failure("/videos/clip.mp4: No such file or directory", src),
            JobError::InputNotFound("/videos/clip.mp4".into())
        );
        assert_eq!(
            classify_transcode_failure("/out/clip.gif: Permission denied", src),
            JobError::PermissionDenied
        );
        let long = format!("header\n{}\n", "x".repeat(500));
        match classify_transcode_failure(&long, src) {
            JobError::Transcode(msg) => {
                assert!(msg.starts_with("xxx"));
                assert_eq!(msg.chars().count(), MAX_ERROR_LEN + 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn partial_frames_directory_is_removed_unless_shared() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("clip_frames");
        fs::create_dir_all(&frames).unwrap();
        fs::write(frames.join("frame_0001.png"), b"png").unwrap();
        remove_partial_output(&frames, OutputFormat::PngSequence);
        assert!(!frames.exists());

        // A directory holding other files keeps them; the failure is only logged
        fs::create_dir_all(&frames).unwrap();
        fs::write(frames.join("frame_0001.png"), b"png").unwrap();
        fs::write(frames.join("notes.txt"), b"keep").unwrap();
        remove_partial_output(&frames, OutputFormat::PngSequence);
        assert!(!frames.join("frame_0001.png").exists());
        assert!(frames.join("notes.txt").exists());

        // Already gone is not an error
        remove_partial_output(&dir.path().join("never_made"), OutputFormat::PngSequence);
    }
}
