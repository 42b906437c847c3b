use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayPosition {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOverlay {
    pub position: OverlayPosition,
    pub text: String,
    pub size: u32,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscodeSettings {
    pub frame_rate: u32,
    /// "W:H", either side may be -1 to keep the aspect ratio
    pub target_scale: String,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub custom_filters: Option<String>,
    pub text_overlays: Vec<TextOverlay>,
    /// File identifiers (source paths) the text overlays apply to
    pub overlay_file_set: BTreeSet<String>,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            frame_rate: 15,
            target_scale: "480:-1".to_string(),
            start_time: None,
            duration: None,
            custom_filters: None,
            text_overlays: Vec::new(),
            overlay_file_set: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DitherMode {
    None,
    FloydSteinberg,
    Bayer,
    #[default]
    Sierra2,
}

impl DitherMode {
    /// paletteuse `dither=` value, including any mode-specific options.
    pub fn paletteuse_arg(self) -> &'static str {
        match self {
            DitherMode::None => "none",
            DitherMode::FloydSteinberg => "floyd_steinberg",
            DitherMode::Bayer => "bayer:bayer_scale=5",
            DitherMode::Sierra2 => "sierra2_4a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaletteType {
    #[default]
    Default,
    Grayscale,
    Web,
    Adaptive,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizeSettings {
    pub optimization_level: u8,
    pub lossy: u16,
    pub color_count: u16,
    pub dither_mode: DitherMode,
    pub interlace: bool,
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
    /// 0 means loop forever
    pub loop_count: u32,
    /// Frame delay in hundredths of a second
    pub frame_delay: Option<u32>,
    pub palette_type: PaletteType,
    pub custom_palette: Vec<String>,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            optimization_level: 1,
            lossy: 0,
            color_count: 256,
            dither_mode: DitherMode::default(),
            interlace: false,
            loop_enabled: true,
            loop_count: 0,
            frame_delay: None,
            palette_type: PaletteType::default(),
            custom_palette: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Gif,
    PngSequence,
    Video,
}

impl OutputFormat {
    pub fn extension(self) -> Option<&'static str> {
        match self {
            OutputFormat::Gif => Some("gif"),
            OutputFormat::Video => Some("mp4"),
            OutputFormat::PngSequence => None,
        }
    }
}

/// Crop rectangle selected against a preview image of
/// `reference_image_width` x `reference_image_height` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropSpec {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub reference_image_width: f64,
    pub reference_image_height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionSettings {
    pub transcode: TranscodeSettings,
    pub optimize: OptimizeSettings,
    pub output_format: OutputFormat,
    pub output_directory: PathBuf,
    /// Keyed by file identifier (the source path as given). A missing
    /// entry means no crop for that file.
    pub crop_by_file: HashMap<String, CropSpec>,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            transcode: TranscodeSettings::default(),
            optimize: OptimizeSettings::default(),
            output_format: OutputFormat::default(),
            output_directory: PathBuf::from("."),
            crop_by_file: HashMap::new(),
        }
    }
}

impl ConversionSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let t = &self.transcode;
        let o = &self.optimize;

        if t.frame_rate == 0 {
            return Err(SettingsError::FrameRate);
        }
        if parse_scale(&t.target_scale).is_none() {
            return Err(SettingsError::Scale(t.target_scale.clone()));
        }
        if !(1..=3).contains(&o.optimization_level) {
            return Err(SettingsError::OptimizationLevel(o.optimization_level));
        }
        if o.lossy > 300 {
            return Err(SettingsError::Lossy(o.lossy));
        }
        if !(2..=256).contains(&o.color_count) {
            return Err(SettingsError::ColorCount(o.color_count));
        }
        if o.palette_type == PaletteType::Custom {
            if o.custom_palette.is_empty() {
                return Err(SettingsError::CustomPalette(String::new()));
            }
            if let Some(bad) = o.custom_palette.iter().find(|c| parse_hex_color(c).is_none()) {
                return Err(SettingsError::CustomPalette(bad.clone()));
            }
        }
        if self.output_directory.as_os_str().is_empty() {
            return Err(SettingsError::OutputDirectory);
        }
        Ok(())
    }

    pub fn crop_for(&self, file_id: &str) -> Option<&CropSpec> {
        self.crop_by_file.get(file_id)
    }

    pub fn overlays_apply_to(&self, file_id: &str) -> bool {
        self.transcode.overlay_file_set.contains(file_id)
    }
}

/// Parses "W:H" where each side is a positive integer or -1/-2.
pub fn parse_scale(scale: &str) -> Option<(i32, i32)> {
    let (w, h) = scale.trim().split_once(':')?;
    let w: i32 = w.trim().parse().ok()?;
    let h: i32 = h.trim().parse().ok()?;
    let valid = |v: i32| v > 0 || v == -1 || v == -2;
    if !valid(w) || !valid(h) || (w < 0 && h < 0) {
        return None;
    }
    Some((w, h))
}

/// Accepts "#RRGGBB", "RRGGBB" and "0xRRGGBB".
pub fn parse_hex_color(color: &str) -> Option<[u8; 3]> {
    let hex = color
        .trim()
        .trim_start_matches('#')
        .trim_start_matches("0x");
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ConversionSettings::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut settings = ConversionSettings::default();
        settings.optimize.color_count = 1;
        assert_eq!(settings.validate(), Err(SettingsError::ColorCount(1)));

        let mut settings = ConversionSettings::default();
        settings.optimize.lossy = 301;
        assert_eq!(settings.validate(), Err(SettingsError::Lossy(301)));

        let mut settings = ConversionSettings::default();
        settings.optimize.optimization_level = 4;
        assert_eq!(settings.validate(), Err(SettingsError::OptimizationLevel(4)));

        let mut settings = ConversionSettings::default();
        settings.transcode.frame_rate = 0;
        assert_eq!(settings.validate(), Err(SettingsError::FrameRate));
    }

    #[test]
    fn custom_palette_needs_hex_colors() {
        let mut settings = ConversionSettings::default();
        settings.optimize.palette_type = PaletteType::Custom;
        assert!(settings.validate().is_err());

        settings.optimize.custom_palette = vec!["#ff0000".into(), "zzzzzz".into()];
        assert_eq!(
            settings.validate(),
            Err(SettingsError::CustomPalette("zzzzzz".into()))
        );

        settings.optimize.custom_palette = vec!["#ff0000".into(), "00FF00".into()];
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn scale_parsing() {
        assert_eq!(parse_scale("480:-1"), Some((480, -1)));
        assert_eq!(parse_scale("-1:360"), Some((-1, 360)));
        assert_eq!(parse_scale("-1:-1"), None);
        assert_eq!(parse_scale("480"), None);
        assert_eq!(parse_scale("0:100"), None);
        assert_eq!(parse_scale("abc:100"), None);
    }

    #[test]
    fn hex_colors() {
        assert_eq!(parse_hex_color("#FF8000"), Some([255, 128, 0]));
        assert_eq!(parse_hex_color("0x000000"), Some([0, 0, 0]));
        assert_eq!(parse_hex_color("#fff"), None);
    }

    #[test]
    fn settings_json_uses_ui_names() {
        let json = r#"{
            "transcode": { "frameRate": 12, "targetScale": "320:-1" },
            "optimize": { "lossy": 80, "colorCount": 128, "ditherMode": "floyd_steinberg", "loop": false },
            "outputFormat": "png-sequence",
            "outputDirectory": "/tmp/out",
            "cropByFile": {
                "a.mp4": { "x": 1, "y": 2, "width": 30, "height": 40,
                           "referenceImageWidth": 120, "referenceImageHeight": 68 }
            }
        }"#;
        let settings: ConversionSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.transcode.frame_rate, 12);
        assert_eq!(settings.optimize.color_count, 128);
        assert_eq!(settings.optimize.dither_mode, DitherMode::FloydSteinberg);
        assert!(!settings.optimize.loop_enabled);
        assert_eq!(settings.output_format, OutputFormat::PngSequence);
        assert_eq!(settings.crop_for("a.mp4").unwrap().reference_image_width, 120.0);
        assert!(settings.crop_for("b.mp4").is_none());
    }
}
