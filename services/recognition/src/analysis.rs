//! The analysis document stored with every image record.
//!
//! On the wire each descriptor is a `{"class", "description"}` pair and
//! the document is `{"predictions": [...], "objects": [...]}`. In memory
//! the descriptors are a typed [`DescriptorEntry`] union.

use crate::feature_extractor::{BrightnessLevel, DominantColor, FeatureDescriptor};
use crate::object_detector::Detection;
use serde::{Deserialize, Serialize};

const DIMENSIONS: &str = "Image dimensions";
const FORMAT: &str = "Image format";
const MAIN_COLOR: &str = "Main color";
const BRIGHTNESS: &str = "Brightness";
const AVERAGE_RGB: &str = "Average RGB";

/// One labeled image descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "DescriptorPair", try_from = "DescriptorPair")]
pub enum DescriptorEntry {
    Dimensions { width: u32, height: u32 },
    Format(String),
    DominantColor(DominantColor),
    Brightness(BrightnessLevel),
    /// Channel means truncated to integers
    MeanChannels { r: u8, g: u8, b: u8 },
}

impl DescriptorEntry {
    pub fn label(&self) -> &'static str {
        match self {
            DescriptorEntry::Dimensions { .. } => DIMENSIONS,
            DescriptorEntry::Format(_) => FORMAT,
            DescriptorEntry::DominantColor(_) => MAIN_COLOR,
            DescriptorEntry::Brightness(_) => BRIGHTNESS,
            DescriptorEntry::MeanChannels { .. } => AVERAGE_RGB,
        }
    }

    pub fn description(&self) -> String {
        match self {
            DescriptorEntry::Dimensions { width, height } => format!("{width}x{height}"),
            DescriptorEntry::Format(format) => format.clone(),
            DescriptorEntry::DominantColor(color) => color.to_string(),
            DescriptorEntry::Brightness(level) => level.to_string(),
            DescriptorEntry::MeanChannels { r, g, b } => format!("R:{r}, G:{g}, B:{b}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DescriptorPair {
    class: String,
    description: String,
}

impl From<DescriptorEntry> for DescriptorPair {
    fn from(entry: DescriptorEntry) -> Self {
        Self {
            class: entry.label().to_string(),
            description: entry.description(),
        }
    }
}

impl TryFrom<DescriptorPair> for DescriptorEntry {
    type Error = String;

    fn try_from(pair: DescriptorPair) -> Result<Self, Self::Error> {
        let text = pair.description.as_str();
        match pair.class.as_str() {
            DIMENSIONS => {
                let (width, height) = text
                    .split_once('x')
                    .ok_or_else(|| format!("malformed dimensions: {text}"))?;
                Ok(DescriptorEntry::Dimensions {
                    width: width.parse().map_err(|_| format!("malformed width: {text}"))?,
                    height: height.parse().map_err(|_| format!("malformed height: {text}"))?,
                })
            }
            FORMAT => Ok(DescriptorEntry::Format(text.to_string())),
            MAIN_COLOR => Ok(DescriptorEntry::DominantColor(text.parse()?)),
            BRIGHTNESS => Ok(DescriptorEntry::Brightness(text.parse()?)),
            AVERAGE_RGB => parse_channels(text)
                .map(|[r, g, b]| DescriptorEntry::MeanChannels { r, g, b })
                .ok_or_else(|| format!("malformed channel means: {text}")),
            other => Err(format!("unknown descriptor class: {other}")),
        }
    }
}

/// `"R:12, G:34, B:56"` -> `[12, 34, 56]`
fn parse_channels(text: &str) -> Option<[u8; 3]> {
    let mut values = [0u8; 3];
    let mut parts = text.split(',').map(str::trim);
    for (value, prefix) in values.iter_mut().zip(["R:", "G:", "B:"]) {
        *value = parts.next()?.strip_prefix(prefix)?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(values)
}

/// Combined feature descriptors and detections for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(rename = "predictions")]
    pub descriptors: Vec<DescriptorEntry>,
    #[serde(rename = "objects")]
    pub detections: Vec<Detection>,
}

impl AnalysisResult {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Merge extractor and detector output into one document.
///
/// Descriptors always come first, in a fixed order: dimensions, format,
/// dominant color, brightness, mean channels. Detections follow unchanged.
pub fn merge(descriptor: &FeatureDescriptor, detections: Vec<Detection>) -> AnalysisResult {
    let [r, g, b] = descriptor.mean_channels.truncated();

    AnalysisResult {
        descriptors: vec![
            DescriptorEntry::Dimensions {
                width: descriptor.width,
                height: descriptor.height,
            },
            DescriptorEntry::Format(descriptor.format.clone()),
            DescriptorEntry::DominantColor(descriptor.dominant_color),
            DescriptorEntry::Brightness(descriptor.brightness_level),
            DescriptorEntry::MeanChannels {
                r,
                g,
                b,
            },
        ],
        detections,
    }
}
