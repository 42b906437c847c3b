use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gifbatch::batch::{BatchEvent, BatchOrchestrator, BatchStatus};
use gifbatch::ffmpeg::{ExecutablePaths, TokioProcessRunner};
use gifbatch::filters::estimate_gif_bytes;
use gifbatch::logging::init_logging;
use gifbatch::probe::probe;
use gifbatch::settings::{
    ConversionSettings, CropSpec, DitherMode, OutputFormat, OverlayPosition, PaletteType, TextOverlay,
};
use gifbatch::thumbnail::{extract_thumbnail, DEFAULT_THUMBNAIL_WIDTH};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "gifbatch")]
#[command(version)]
#[command(about = "Batch convert videos to optimised GIFs, PNG frames or MP4", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one or more videos
    Convert {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Overwrite existing outputs without asking
        #[arg(long, short = 'y')]
        yes: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Show size, duration and an output size estimate
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        settings: SettingsArgs,
    },
    /// Extract a preview frame
    Thumbnail {
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_THUMBNAIL_WIDTH)]
        width: u32,

        /// Write the PNG here instead of printing JSON with a data URI
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Verify ffmpeg, ffprobe and gifsicle can be run
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Gif,
    Png,
    Mp4,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DitherArg {
    None,
    FloydSteinberg,
    Bayer,
    Sierra2,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PaletteArg {
    Default,
    Grayscale,
    Web,
    Adaptive,
    Custom,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum PositionArg {
    Top,
    Middle,
    #[default]
    Bottom,
}

/// Flags layered over the defaults and the optional settings file.
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// JSON settings file (camelCase keys)
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    #[arg(long, short = 'f', value_enum)]
    format: Option<FormatArg>,

    #[arg(long)]
    fps: Option<u32>,

    /// W:H, -1 keeps the aspect ratio
    #[arg(long)]
    scale: Option<String>,

    /// Trim start in seconds
    #[arg(long)]
    start: Option<f64>,

    /// Trim length in seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Crop as W:H:X:Y fractions, or W:H:X:Y@RWxRH pixels of a reference frame
    #[arg(long)]
    crop: Option<String>,

    #[arg(long)]
    colors: Option<u16>,

    #[arg(long)]
    lossy: Option<u16>,

    /// gifsicle optimisation level 1-3
    #[arg(short = 'O', long = "optimize")]
    optimize: Option<u8>,

    #[arg(long, value_enum)]
    dither: Option<DitherArg>,

    #[arg(long, value_enum)]
    palette: Option<PaletteArg>,

    /// Colours for --palette custom, e.g. "#000000,#ffffff"
    #[arg(long, value_delimiter = ',')]
    palette_colors: Vec<String>,

    #[arg(long)]
    no_loop: bool,

    /// Loop count, 0 = forever
    #[arg(long)]
    loop_count: Option<u32>,

    /// Frame delay in 1/100 s
    #[arg(long)]
    delay: Option<u32>,

    #[arg(long)]
    interlace: bool,

    /// Extra filters appended to the chain
    #[arg(long)]
    filter: Option<String>,

    /// Caption drawn on every file
    #[arg(long)]
    text: Option<String>,

    #[arg(long, value_enum, default_value = "bottom")]
    text_position: PositionArg,

    #[arg(long, default_value_t = 24)]
    text_size: u32,

    #[arg(long, default_value = "white")]
    text_color: String,
}

impl SettingsArgs {
    fn load(&self) -> Result<ConversionSettings> {
        let mut settings = match &self.settings {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings file {}", path.display()))?;
                serde_json::from_str(&json)
                    .with_context(|| format!("Invalid settings file {}", path.display()))?
            }
            None => ConversionSettings::default(),
        };

        let t = &mut settings.transcode;
        if let Some(fps) = self.fps {
            t.frame_rate = fps;
        }
        if let Some(scale) = &self.scale {
            t.target_scale = scale.clone();
        }
        if self.start.is_some() {
            t.start_time = self.start;
        }
        if self.duration.is_some() {
            t.duration = self.duration;
        }
        if self.filter.is_some() {
            t.custom_filters = self.filter.clone();
        }
        if let Some(text) = &self.text {
            let position = match self.text_position {
                PositionArg::Top => OverlayPosition::Top,
                PositionArg::Middle => OverlayPosition::Middle,
                PositionArg::Bottom => OverlayPosition::Bottom,
            };
            t.text_overlays.retain(|o| o.position != position);
            t.text_overlays.push(TextOverlay {
                position,
                text: text.clone(),
                size: self.text_size,
                color: self.text_color.clone(),
            });
        }

        let o = &mut settings.optimize;
        if let Some(colors) = self.colors {
            o.color_count = colors;
        }
        if let Some(lossy) = self.lossy {
            o.lossy = lossy;
        }
        if let Some(level) = self.optimize {
            o.optimization_level = level;
        }
        if let Some(dither) = self.dither {
            o.dither_mode = match dither {
                DitherArg::None => DitherMode::None,
                DitherArg::FloydSteinberg => DitherMode::FloydSteinberg,
                DitherArg::Bayer => DitherMode::Bayer,
                DitherArg::Sierra2 => DitherMode::Sierra2,
            };
        }
        if let Some(palette) = self.palette {
            o.palette_type = match palette {
                PaletteArg::Default => PaletteType::Default,
                PaletteArg::Grayscale => PaletteType::Grayscale,
                PaletteArg::Web => PaletteType::Web,
                PaletteArg::Adaptive => PaletteType::Adaptive,
                PaletteArg::Custom => PaletteType::Custom,
            };
        }
        if !self.palette_colors.is_empty() {
            o.custom_palette = self.palette_colors.clone();
        }
        if self.no_loop {
            o.loop_enabled = false;
        }
        if let Some(count) = self.loop_count {
            o.loop_count = count;
        }
        if self.delay.is_some() {
            o.frame_delay = self.delay;
        }
        if self.interlace {
            o.interlace = true;
        }

        if let Some(format) = self.format {
            settings.output_format = match format {
                FormatArg::Gif => OutputFormat::Gif,
                FormatArg::Png => OutputFormat::PngSequence,
                FormatArg::Mp4 => OutputFormat::Video,
            };
        }
        if let Some(dir) = &self.output_dir {
            settings.output_directory = dir.clone();
        }

        settings.validate()?;
        Ok(settings)
    }
}

/// "W:H:X:Y" as fractions of the frame, or "W:H:X:Y@RWxRH" in pixels of
/// an RWxRH reference image (a thumbnail, or the source size itself).
/// Either way the job rescales it to the real source size.
fn parse_crop(crop: &str) -> Result<CropSpec> {
    let (rect, reference) = match crop.split_once('@') {
        Some((rect, reference)) => (rect, Some(reference)),
        None => (crop, None),
    };
    let parts: Vec<f64> = rect
        .split(':')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Crop must look like W:H:X:Y or W:H:X:Y@RWxRH (got {crop:?})"))?;
    let [width, height, x, y] = match parts.as_slice() {
        [w, h, x, y] if *w > 0.0 && *h > 0.0 && *x >= 0.0 && *y >= 0.0 => [*w, *h, *x, *y],
        _ => bail!("Crop must look like W:H:X:Y with positive size (got {crop:?})"),
    };

    let (reference_image_width, reference_image_height) = match reference {
        Some(reference) => {
            let (rw, rh) = reference
                .split_once(['x', 'X'])
                .and_then(|(rw, rh)| Some((rw.trim().parse::<f64>().ok()?, rh.trim().parse::<f64>().ok()?)))
                .filter(|(rw, rh)| *rw > 0.0 && *rh > 0.0)
                .with_context(|| format!("Crop reference must look like 1920x1080 (got {reference:?})"))?;
            (rw, rh)
        }
        None => {
            if [width, height, x, y].iter().any(|v| *v > 1.0) {
                bail!("Crop without @RWxRH must use fractions between 0 and 1 (got {crop:?})");
            }
            (1.0, 1.0)
        }
    };

    Ok(CropSpec {
        x,
        y,
        width,
        height,
        reference_image_width,
        reference_image_height,
    })
}

fn file_id(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn ask_overwrite(conflicts: &[PathBuf]) -> bool {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        eprintln!(
            "{} output file(s) already exist; pass --yes to overwrite",
            conflicts.len()
        );
        return false;
    }

    eprintln!("These outputs already exist:");
    for path in conflicts {
        eprintln!("  {}", path.display());
    }
    eprint!("Overwrite them? [y/N] ");
    let _ = std::io::stderr().flush();

    let mut answer = String::new();
    if stdin.lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

async fn convert(paths: ExecutablePaths, files: Vec<PathBuf>, yes: bool, args: &SettingsArgs) -> Result<ExitCode> {
    let mut settings = args.load()?;
    let runner = TokioProcessRunner;

    if let Some(crop) = &args.crop {
        let spec = parse_crop(crop)?;
        for file in &files {
            settings.crop_by_file.insert(file_id(file), spec);
        }
    }
    if args.text.is_some() {
        settings.transcode.overlay_file_set.extend(files.iter().map(|f| file_id(f)));
    }

    let orchestrator = Arc::new(BatchOrchestrator::new(runner, paths));
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling...");
                orchestrator.cancel();
            }
        });
    }

    let names: Vec<String> = files.iter().map(|f| display_name(f)).collect();
    let multi = MultiProgress::new();
    let overall = multi.add(ProgressBar::new(files.len() as u64));
    overall.set_style(bar_style("Batch {bar:30.cyan/blue} {pos}/{len} [{elapsed_precise}]"));
    let current = multi.add(ProgressBar::new(100));
    current.set_style(bar_style("{msg:24!} {bar:30.green/white} {pos:>3}%"));

    let sink = {
        let multi = multi.clone();
        let overall = overall.clone();
        let current = current.clone();
        move |event: BatchEvent| {
            debug!(event = event.name(), "batch event");
            match event {
                BatchEvent::BatchStart { .. } => {}
                BatchEvent::FileStart { index, .. } => {
                    current.reset();
                    current.set_message(names.get(index).cloned().unwrap_or_default());
                }
                BatchEvent::FileProgress { percent, .. } => current.set_position(percent as u64),
                BatchEvent::FileCompleted { output_path, optimized, .. } => {
                    overall.inc(1);
                    let note = if optimized { "" } else { " (not optimised)" };
                    let _ = multi.println(format!("✓ {}{note}", output_path.display()));
                }
                BatchEvent::FileError { index, message } => {
                    overall.inc(1);
                    let name = names.get(index).map(String::as_str).unwrap_or("?");
                    let _ = multi.println(format!("✗ {name}: {message}"));
                }
                BatchEvent::BatchCancelled => {
                    let _ = multi.println("Batch cancelled");
                }
                BatchEvent::BatchComplete { .. } => {}
                BatchEvent::BatchError { message } => {
                    let _ = multi.println(format!("Batch refused: {message}"));
                }
            }
        }
    };

    let summary = orchestrator
        .run_batch(files, &settings, &sink, move |conflicts| async move {
            if yes {
                return true;
            }
            tokio::task::spawn_blocking(move || ask_overwrite(&conflicts))
                .await
                .unwrap_or(false)
        })
        .await;

    current.finish_and_clear();
    overall.finish();
    info!(?summary, "done");

    match summary.status {
        BatchStatus::Completed => {
            println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
            Ok(if summary.failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        BatchStatus::Cancelled => {
            println!(
                "Cancelled after {} of {} file(s)",
                summary.succeeded + summary.failed,
                summary.total
            );
            Ok(ExitCode::from(130))
        }
        BatchStatus::Declined => Ok(ExitCode::FAILURE),
        BatchStatus::Rejected(reason) => bail!(reason),
    }
}

async fn probe_files(paths: ExecutablePaths, files: Vec<PathBuf>, args: &SettingsArgs) -> Result<ExitCode> {
    let settings = args.load()?;
    let runner = TokioProcessRunner;
    for file in &files {
        let info = probe(&runner, &paths, file).await;
        println!(
            "{}: {}x{}, {:.2}s, estimated GIF ~{}",
            file.display(),
            info.width,
            info.height,
            info.duration,
            HumanBytes(estimate_gif_bytes(&settings, &file_id(file), &info))
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn thumbnail(paths: ExecutablePaths, file: PathBuf, width: u32, output: Option<PathBuf>) -> Result<ExitCode> {
    let thumb = extract_thumbnail(&TokioProcessRunner, &paths, &file, width).await?;
    match output {
        Some(path) => {
            let (_, encoded) = thumb
                .data_uri
                .split_once(',')
                .context("Malformed data URI")?;
            let bytes = BASE64.decode(encoded).context("Malformed thumbnail data")?;
            std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} ({}x{})", path.display(), thumb.width, thumb.height);
        }
        None => println!("{}", serde_json::to_string_pretty(&thumb)?),
    }
    Ok(ExitCode::SUCCESS)
}

async fn check(paths: ExecutablePaths) -> Result<ExitCode> {
    let missing = paths.check(&TokioProcessRunner).await;
    for program in [&paths.ffmpeg, &paths.ffprobe, &paths.gifsicle] {
        let mark = if missing.contains(program) { "✗" } else { "✓" };
        println!("{mark} {}", program.display());
    }
    Ok(if missing.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = ExecutablePaths::resolve(None);
    debug!(?paths, "resolved encoders");

    match cli.command {
        Command::Convert { files, yes, settings } => convert(paths, files, yes, &settings).await,
        Command::Probe { files, settings } => probe_files(paths, files, &settings).await,
        Command::Thumbnail { file, width, output } => thumbnail(paths, file, width, output).await,
        Command::Check => check(paths).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_settings_defaults() {
        let cli = Cli::try_parse_from([
            "gifbatch", "convert", "a.mp4", "--fps", "10", "--scale", "320:-1", "-O", "3", "--format", "mp4",
            "-o", "out",
        ])
        .unwrap();
        let Command::Convert { settings, .. } = cli.command else {
            panic!("expected convert");
        };
        let settings = settings.load().unwrap();
        assert_eq!(settings.transcode.frame_rate, 10);
        assert_eq!(settings.transcode.target_scale, "320:-1");
        assert_eq!(settings.optimize.optimization_level, 3);
        assert_eq!(settings.output_format, OutputFormat::Video);
        assert_eq!(settings.output_directory, PathBuf::from("out"));
    }

    #[test]
    fn invalid_flags_are_rejected() {
        let args = SettingsArgs {
            fps: Some(0),
            ..Default::default()
        };
        assert!(args.load().is_err());
    }

    #[test]
    fn crop_flag_parses() {
        let spec = parse_crop("0.5:0.25:0.1:0").unwrap();
        assert_eq!((spec.width, spec.height, spec.x, spec.y), (0.5, 0.25, 0.1, 0.0));
        assert_eq!((spec.reference_image_width, spec.reference_image_height), (1.0, 1.0));

        let spec = parse_crop("100:50:10:20@320x180").unwrap();
        assert_eq!((spec.width, spec.height, spec.x, spec.y), (100.0, 50.0, 10.0, 20.0));
        assert_eq!((spec.reference_image_width, spec.reference_image_height), (320.0, 180.0));

        assert!(parse_crop("100:50:10:20").is_err());
        assert!(parse_crop("100:50:10@320x180").is_err());
        assert!(parse_crop("0:50:10:20@320x180").is_err());
        assert!(parse_crop("100:50:10:20@320").is_err());
        assert!(parse_crop("a:b:c:d").is_err());
    }

    #[test]
    fn byte_sizes_are_readable() {
        assert_eq!(HumanBytes(512).to_string(), "512 B");
        assert_eq!(HumanBytes(5 * 1024 * 1024).to_string(), "5.00 MiB");
    }
}
