//! Deterministic visual descriptors computed from raw image bytes.
//!
//! The extractor decodes the image, flattens it to 8-bit RGB and derives
//! dimensions, container format, mean channel intensities and the two
//! coarse classes (dominant color, brightness) from those means. It does
//! no I/O and holds no state, so the same bytes always produce the same
//! [`FeatureDescriptor`].

use image::{GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while extracting features.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Undecodable image: {0}")]
    Undecodable(String),

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

/// Coarse color class derived from the mean channel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DominantColor {
    Black,
    White,
    Red,
    Green,
    Blue,
    Gray,
    Yellow,
    Unknown,
}

/// Coarse brightness class derived from the average of the channel means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrightnessLevel {
    Dark,
    Medium,
    Bright,
}

/// Average intensity per channel, each in `0.0..=255.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanChannels {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl MeanChannels {
    /// Channel means truncated toward zero, as shown in analysis documents.
    pub fn truncated(&self) -> [u8; 3] {
        [self.r as u8, self.g as u8, self.b as u8]
    }

    /// `(r + g + b) / 3`
    pub fn brightness(&self) -> f64 {
        (self.r + self.g + self.b) / 3.0
    }
}

/// Output of [`extract`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub width: u32,
    pub height: u32,
    /// Container format tag, e.g. `PNG` or `JPEG`
    pub format: String,
    pub dominant_color: DominantColor,
    pub brightness_level: BrightnessLevel,
    pub mean_channels: MeanChannels,
}

/// Decode `bytes` and compute its [`FeatureDescriptor`].
///
/// Grayscale, palette and alpha images are flattened to three channels
/// before statistics are taken; alpha is dropped, not composited.
pub fn extract(bytes: &[u8]) -> Result<FeatureDescriptor, ExtractionError> {
    let format =
        image::guess_format(bytes).map_err(|e| ExtractionError::Undecodable(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ExtractionError::Undecodable(e.to_string()))?;

    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(ExtractionError::EmptyImage { width, height });
    }

    let rgb = decoded.to_rgb8();
    let mut sums = [0u64; 3];
    for pixel in rgb.pixels() {
        sums[0] += u64::from(pixel[0]);
        sums[1] += u64::from(pixel[1]);
        sums[2] += u64::from(pixel[2]);
    }

    let count = u64::from(width) * u64::from(height);
    let mean_channels = MeanChannels {
        r: sums[0] as f64 / count as f64,
        g: sums[1] as f64 / count as f64,
        b: sums[2] as f64 / count as f64,
    };

    let descriptor = FeatureDescriptor {
        width,
        height,
        format: format_tag(format),
        dominant_color: classify_color(mean_channels.r, mean_channels.g, mean_channels.b),
        brightness_level: classify_brightness(mean_channels.brightness()),
        mean_channels,
    };

    trace!(?descriptor, "Extracted image features");

    Ok(descriptor)
}

/// Classify mean channel values into a [`DominantColor`].
///
/// Rules are evaluated in order and the first match wins. The near-gray
/// test runs before the yellow test, so a warm near-neutral color lands
/// in Gray/White/Black rather than Yellow.
pub fn classify_color(r: f64, g: f64, b: f64) -> DominantColor {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);

    if max < 60.0 {
        DominantColor::Black
    } else if min > 200.0 {
        DominantColor::White
    } else if r > g.max(b) + 20.0 {
        DominantColor::Red
    } else if g > r.max(b) + 20.0 {
        DominantColor::Green
    } else if b > r.max(g) + 20.0 {
        DominantColor::Blue
    } else if (r - g).abs() < 20.0 && (r - b).abs() < 20.0 && (g - b).abs() < 20.0 {
        let sum = r + g + b;
        if sum > 600.0 {
            DominantColor::White
        } else if sum < 300.0 {
            DominantColor::Black
        } else {
            DominantColor::Gray
        }
    } else if r > 200.0 && g > 150.0 && b < 100.0 {
        DominantColor::Yellow
    } else {
        DominantColor::Unknown
    }
}

/// Classify an average intensity into a [`BrightnessLevel`].
pub fn classify_brightness(brightness: f64) -> BrightnessLevel {
    if brightness < 80.0 {
        BrightnessLevel::Dark
    } else if brightness > 200.0 {
        BrightnessLevel::Bright
    } else {
        BrightnessLevel::Medium
    }
}

fn format_tag(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::WebP => "WEBP".to_string(),
        ImageFormat::OpenExr => "EXR".to_string(),
        other => other
            .extensions_str()
            .first()
            .map(|ext| ext.to_ascii_uppercase())
            .unwrap_or_else(|| format!("{other:?}").to_ascii_uppercase()),
    }
}

impl fmt::Display for DominantColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DominantColor::Black => "Black",
            DominantColor::White => "White",
            DominantColor::Red => "Red",
            DominantColor::Green => "Green",
            DominantColor::Blue => "Blue",
            DominantColor::Gray => "Gray",
            DominantColor::Yellow => "Yellow",
            DominantColor::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for DominantColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Black" => Ok(DominantColor::Black),
            "White" => Ok(DominantColor::White),
            "Red" => Ok(DominantColor::Red),
            "Green" => Ok(DominantColor::Green),
            "Blue" => Ok(DominantColor::Blue),
            "Gray" => Ok(DominantColor::Gray),
            "Yellow" => Ok(DominantColor::Yellow),
            "Unknown" => Ok(DominantColor::Unknown),
            other => Err(format!("unknown color class: {other}")),
        }
    }
}

impl fmt::Display for BrightnessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrightnessLevel::Dark => "Dark",
            BrightnessLevel::Medium => "Medium brightness",
            BrightnessLevel::Bright => "Bright",
        };
        f.write_str(name)
    }
}

impl FromStr for BrightnessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dark" => Ok(BrightnessLevel::Dark),
            "Medium brightness" | "Medium" => Ok(BrightnessLevel::Medium),
            "Bright" => Ok(BrightnessLevel::Bright),
            other => Err(format!("unknown brightness level: {other}")),
        }
    }
}
