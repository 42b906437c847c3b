use crate::error::ThumbnailError;
use crate::ffmpeg::{ExecutablePaths, Invocation, ProcessRunner};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageFormat, ImageReader};
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 120;

/// Preview frame used as the reference image when picking a crop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    /// `data:image/png;base64,...`
    pub data_uri: String,
    pub width: u32,
    pub height: u32,
}

/// Pixel size of an encoded PNG, read from its header.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    ImageReader::with_format(Cursor::new(bytes), ImageFormat::Png)
        .into_dimensions()
        .ok()
}

fn frame_args(input: &Path, output: &Path, width: u32, alternate: bool) -> Vec<String> {
    let input = input.to_string_lossy().into_owned();
    let output = output.to_string_lossy().into_owned();
    if alternate {
        // Let ffmpeg pick a representative frame; copes with very short clips
        vec![
            "-y".into(),
            "-i".into(),
            input,
            "-vf".into(),
            format!("thumbnail,scale={width}:-1"),
            "-frames:v".into(),
            "1".into(),
            output,
        ]
    } else {
        vec![
            "-y".into(),
            "-i".into(),
            input,
            "-ss".into(),
            "0".into(),
            "-an".into(),
            "-vframes".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={width}:-1"),
            output,
        ]
    }
}

pub async fn extract_thumbnail<R: ProcessRunner>(
    runner: &R,
    paths: &ExecutablePaths,
    input: &Path,
    width: u32,
) -> Result<Thumbnail, ThumbnailError> {
    let width = width.max(16);

    // Temp file for the frame; removed when `frame` drops
    let frame = tempfile::Builder::new()
        .prefix("thumb_")
        .suffix(".png")
        .tempfile()?
        .into_temp_path();

    let mut last_error = String::new();
    for alternate in [false, true] {
        let invocation = Invocation::new(paths.ffmpeg.clone(), frame_args(input, &frame, width, alternate));
        let output = runner.output(&invocation).await?;
        let produced = std::fs::metadata(&frame).map(|m| m.len() > 0).unwrap_or(false);

        if output.success() && produced {
            let bytes = std::fs::read(&frame)?;
            let (w, h) = png_dimensions(&bytes)
                .ok_or_else(|| ThumbnailError::Extract("ffmpeg did not write a PNG".to_string()))?;
            debug!(file = %input.display(), width = w, height = h, "thumbnail extracted");
            return Ok(Thumbnail {
                data_uri: format!("data:image/png;base64,{}", BASE64.encode(&bytes)),
                width: w,
                height: h,
            });
        }

        last_error = output
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no frame written")
            .trim()
            .to_string();
        if !alternate {
            warn!(file = %input.display(), error = %last_error, "first thumbnail attempt failed, trying alternate");
        }
    }

    Err(ThumbnailError::Extract(last_error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_png(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::new(width, height)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn reads_png_size() {
        let png = encoded_png(120, 68);
        assert_eq!(png_dimensions(&png), Some((120, 68)));
        assert_eq!(png_dimensions(b"GIF89a............................"), None);
        assert_eq!(png_dimensions(&png[..20]), None);
    }

    #[test]
    fn alternate_uses_thumbnail_filter() {
        let args = frame_args(Path::new("in.mp4"), Path::new("out.png"), 120, true);
        assert!(args.contains(&"thumbnail,scale=120:-1".to_string()));
        let args = frame_args(Path::new("in.mp4"), Path::new("out.png"), 120, false);
        assert!(args.contains(&"scale=120:-1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.png"));
    }
}
