//! Filter-graph construction for the transcoder.
//!
//! The chain is always composed in the same order:
//! crop, fps, scale, text overlays, custom fragment, palette (GIF only).
//! Crop has to come before scale so its coordinates stay in source
//! pixels, and palette statistics have to be taken on the final frames.

use crate::probe::VideoInfo;
use crate::settings::{
    parse_hex_color, parse_scale, ConversionSettings, CropSpec, OutputFormat, OverlayPosition,
    PaletteType,
};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::warn;

/// Smallest crop edge accepted in source pixels.
pub const MIN_CROP_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

/// Maps a crop chosen on the preview image onto source pixels, using
/// independent horizontal and vertical factors. Returns `None` when the
/// result is smaller than `MIN_CROP_SIZE` on either axis after clamping
/// to the frame.
pub fn rescale_crop(spec: &CropSpec, source: &VideoInfo) -> Option<CropRect> {
    if !(spec.reference_image_width > 0.0) || !(spec.reference_image_height > 0.0) {
        return None;
    }
    let source_w = source.width as f64;
    let source_h = source.height as f64;
    let scale_x = source_w / spec.reference_image_width;
    let scale_y = source_h / spec.reference_image_height;

    let x = (spec.x * scale_x).round().clamp(0.0, source_w);
    let y = (spec.y * scale_y).round().clamp(0.0, source_h);
    let width = (spec.width * scale_x).round().clamp(0.0, source_w - x);
    let height = (spec.height * scale_y).round().clamp(0.0, source_h - y);

    let rect = CropRect {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    };
    if rect.width < MIN_CROP_SIZE || rect.height < MIN_CROP_SIZE {
        return None;
    }
    Some(rect)
}

/// Crop to apply for `file_id`, if it has one and it survives rescaling.
pub fn resolve_crop(
    settings: &ConversionSettings,
    file_id: &str,
    source: &VideoInfo,
) -> Option<CropRect> {
    let spec = settings.crop_for(file_id)?;
    let rect = rescale_crop(spec, source);
    if rect.is_none() {
        warn!(file = file_id, ?spec, ?source, "crop is out of bounds or too small, converting full frame");
    }
    rect
}

/// Builds the filter graph for one file. `source` carries the true video
/// dimensions; without it no crop is applied.
pub fn build_filter_chain(
    settings: &ConversionSettings,
    file_id: &str,
    source: Option<&VideoInfo>,
) -> String {
    let crop = source.and_then(|info| resolve_crop(settings, file_id, info));
    compose(settings, file_id, crop.as_ref())
}

/// Same as `build_filter_chain` with the crop already resolved.
pub fn compose(settings: &ConversionSettings, file_id: &str, crop: Option<&CropRect>) -> String {
    let t = &settings.transcode;
    let mut filters: Vec<String> = Vec::new();

    if let Some(rect) = crop {
        filters.push(rect.filter());
    }

    filters.push(format!("fps={}", t.frame_rate));
    filters.push(scale_filter(&t.target_scale, settings.output_format));

    if settings.overlays_apply_to(file_id) {
        for position in [OverlayPosition::Top, OverlayPosition::Middle, OverlayPosition::Bottom] {
            let overlay = t
                .text_overlays
                .iter()
                .find(|o| o.position == position && !o.text.trim().is_empty());
            if let Some(overlay) = overlay {
                filters.push(drawtext_filter(position, &overlay.text, overlay.size, &overlay.color));
            }
        }
    }

    if let Some(custom) = t.custom_filters.as_deref().map(str::trim) {
        if !custom.is_empty() {
            filters.push(custom.trim_matches(',').to_string());
        }
    }

    let chain = filters.join(",");
    if settings.output_format != OutputFormat::Gif {
        return chain;
    }

    let o = &settings.optimize;
    let dither = o.dither_mode.paletteuse_arg();
    match o.palette_type {
        // palette image comes in as the second input
        PaletteType::Custom => format!("[0:v]{chain}[x];[x][1:v]paletteuse=dither={dither}"),
        palette => {
            let stats = match palette {
                PaletteType::Adaptive => "diff",
                PaletteType::Web => "single",
                _ => "full",
            };
            let desaturate = if palette == PaletteType::Grayscale { ",hue=s=0" } else { "" };
            format!(
                "{chain}{desaturate},split[s0][s1];[s0]palettegen=max_colors={}:stats_mode={stats}[p];[s1][p]paletteuse=dither={dither}",
                o.color_count
            )
        }
    }
}

/// True when the chain expects a palette image as input 1.
pub fn needs_palette_input(settings: &ConversionSettings) -> bool {
    settings.output_format == OutputFormat::Gif && settings.optimize.palette_type == PaletteType::Custom
}

fn scale_filter(target_scale: &str, format: OutputFormat) -> String {
    let (w, h) = parse_scale(target_scale).unwrap_or((480, -1));
    // libx264 wants even dimensions
    let fix = |v: i32| if format == OutputFormat::Video && v == -1 { -2 } else { v };
    format!("scale={}:{}:flags=lanczos", fix(w), fix(h))
}

fn drawtext_filter(position: OverlayPosition, text: &str, size: u32, color: &str) -> String {
    let y = match position {
        OverlayPosition::Top => "10",
        OverlayPosition::Middle => "(h-text_h)/2",
        OverlayPosition::Bottom => "h-text_h-10",
    };
    let color = if color.trim().is_empty() { "white" } else { color.trim() };
    format!(
        "drawtext=text='{}':fontsize={}:fontcolor={}:borderw=2:bordercolor=black:x=(w-text_w)/2:y={}",
        escape_drawtext(text),
        size.max(1),
        color.replace(['\'', ':', ',', ';'], ""),
        y
    )
}

/// Quotes text for a single-quoted drawtext value inside a filter graph.
/// A literal quote closes the quoted run, is emitted escaped and reopens
/// it; `\`, `%` and `:` are escaped for the option and expansion levels.
pub fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\\\\\")
        .replace('%', "\\\\%")
        .replace(':', "\\:")
        .replace('\'', "'\\\\\\''")
}

/// 16x16 PNG holding `colors`, padded with the last one, for paletteuse.
/// `None` when no colour parses.
pub fn palette_image(colors: &[String]) -> Option<Vec<u8>> {
    let parsed: Vec<[u8; 3]> = colors.iter().filter_map(|c| parse_hex_color(c)).take(256).collect();
    let last = *parsed.last()?;

    let image = RgbImage::from_fn(16, 16, |x, y| {
        Rgb(*parsed.get((y * 16 + x) as usize).unwrap_or(&last))
    });
    let mut png = Vec::new();
    if let Err(e) = image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png) {
        warn!(error = %e, "could not encode palette image");
        return None;
    }
    Some(png)
}

/// Output frame size after scaling (and cropping), given the source.
pub fn output_dimensions(settings: &ConversionSettings, source: &VideoInfo, crop: Option<&CropRect>) -> (u32, u32) {
    let (src_w, src_h) = match crop {
        Some(rect) => (rect.width as f64, rect.height as f64),
        None => (source.width as f64, source.height as f64),
    };
    let (w, h) = parse_scale(&settings.transcode.target_scale).unwrap_or((480, -1));
    let (w, h) = match (w > 0, h > 0) {
        (true, true) => (w as f64, h as f64),
        (true, false) => (w as f64, (w as f64 * src_h / src_w).round()),
        (false, true) => ((h as f64 * src_w / src_h).round(), h as f64),
        (false, false) => (src_w, src_h),
    };
    (w.max(1.0) as u32, h.max(1.0) as u32)
}

/// Rough GIF size estimate for display only: uncompressed frame bits
/// (`w*h*log2(colors)/8`) times frame count, scaled down by the lossy
/// and optimisation settings. Not a prediction of the encoder's output.
pub fn estimate_gif_bytes(settings: &ConversionSettings, file_id: &str, source: &VideoInfo) -> u64 {
    let crop = settings
        .crop_for(file_id)
        .and_then(|spec| rescale_crop(spec, source));
    let (w, h) = output_dimensions(settings, source, crop.as_ref());

    let t = &settings.transcode;
    let o = &settings.optimize;
    let start = t.start_time.unwrap_or(0.0).max(0.0);
    let duration = t
        .duration
        .unwrap_or((source.duration - start).max(0.0))
        .max(0.0);
    let frames = (duration * t.frame_rate as f64).ceil();

    let bits_per_pixel = (o.color_count.max(2) as f64).log2();
    let bytes_per_frame = w as f64 * h as f64 * bits_per_pixel / 8.0;

    // LZW plus inter-frame optimisation typically lands well under raw size
    let lossy_factor = 1.0 - (o.lossy.min(300) as f64 / 300.0) * 0.6;
    let optimize_factor = match o.optimization_level {
        3 => 0.5,
        2 => 0.6,
        _ => 0.7,
    };

    (bytes_per_frame * frames * lossy_factor * optimize_factor).round() as u64
}
