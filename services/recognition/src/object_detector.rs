//! Object detection adapter.
//!
//! The detection model runs out of process. [`HttpDetector`] posts the raw
//! image bytes to an inference endpoint and normalizes whatever label/score
//! shape comes back into [`Detection`] rows. [`DetectorHandle`] owns the
//! configured backend for the lifetime of the process and is injected into
//! the ingestion orchestrator.

use crate::config::DetectorConfig;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while running object detection.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector has been shut down")]
    Unavailable,

    #[error("Empty image payload")]
    EmptyInput,

    #[error("Undecodable image: {0}")]
    Undecodable(String),

    #[error("Detector request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Detector backend error: {0}")]
    Backend(String),

    #[error("Invalid detector response: {0}")]
    InvalidResponse(String),
}

/// One detected object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Always within `0.0..=1.0`
    pub confidence: f32,
}

impl Detection {
    /// Build a detection from raw backend output.
    ///
    /// Returns `None` for blank labels and non-finite scores; finite scores
    /// are clamped into `[0, 1]`.
    pub fn normalized(label: &str, confidence: f32) -> Option<Self> {
        let label = label.trim();
        if label.is_empty() || !confidence.is_finite() {
            return None;
        }

        Some(Self {
            label: label.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// A backend able to find objects in an encoded image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    /// Detect objects in `bytes`. Multiple instances of the same label are
    /// reported as separate rows, in backend order.
    async fn detect(&self, bytes: &[u8]) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector backed by an HTTP inference function.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    health_url: Option<String>,
}

impl HttpDetector {
    pub fn new(endpoint: &str, config: &DetectorConfig) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        let health_url = config
            .health_path
            .as_ref()
            .map(|path| format!("{}/{}", endpoint, path.trim_start_matches('/')));

        Ok(Self {
            client,
            endpoint,
            health_url,
        })
    }

    /// Check that the inference endpoint answers its health path.
    pub async fn probe(&self) -> Result<(), DetectorError> {
        let Some(ref url) = self.health_url else {
            return Ok(());
        };

        self.client.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl ObjectDetector for HttpDetector {
    #[instrument(skip(self, bytes), fields(endpoint = %self.endpoint, size_bytes = bytes.len()))]
    async fn detect(&self, bytes: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        if bytes.is_empty() {
            return Err(DetectorError::EmptyInput);
        }

        // Reject non-images locally instead of paying for a round trip
        image::guess_format(bytes).map_err(|e| DetectorError::Undecodable(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        let detections = parse_response(&body)?;

        debug!(count = detections.len(), "Detector returned objects");

        Ok(detections)
    }
}

#[derive(Debug, Deserialize)]
struct DetectorResponse {
    #[serde(default)]
    predictions: Vec<RawDetection>,
    #[serde(default)]
    objects: Vec<RawDetection>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(alias = "label", alias = "name")]
    class: String,
    #[serde(default, alias = "score")]
    confidence: Option<f32>,
}

/// Parse an inference response body.
///
/// Understands `{"predictions": [{"class", "confidence"}]}` as well as the
/// older `{"objects": [{"class": "dog: 0.87"}]}` shape where the score is
/// appended to the label. Rows without a usable score are skipped.
pub fn parse_response(body: &[u8]) -> Result<Vec<Detection>, DetectorError> {
    let response: DetectorResponse =
        serde_json::from_slice(body).map_err(|e| DetectorError::InvalidResponse(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(DetectorError::Backend(error));
    }

    let detections = response
        .predictions
        .into_iter()
        .chain(response.objects)
        .filter_map(|raw| {
            let detection = match raw.confidence {
                Some(confidence) => Detection::normalized(&raw.class, confidence),
                None => split_embedded_score(&raw.class)
                    .and_then(|(label, confidence)| Detection::normalized(label, confidence)),
            };
            if detection.is_none() {
                debug!(class = %raw.class, "Dropping unusable detection row");
            }
            detection
        })
        .collect();

    Ok(detections)
}

/// `"person: 0.91"` -> `("person", 0.91)`
fn split_embedded_score(class: &str) -> Option<(&str, f32)> {
    let (label, score) = class.rsplit_once(':')?;
    let score = score.trim().parse().ok()?;
    Some((label, score))
}

/// Process-wide handle on the configured detection backend.
///
/// A handle without a backend is valid: detection is simply disabled and
/// every call yields no detections.
pub struct DetectorHandle {
    backend: Option<Arc<dyn ObjectDetector>>,
    active: AtomicBool,
}

impl DetectorHandle {
    /// Build the handle from configuration, probing the backend once if a
    /// health path is configured. A failed probe is logged, not fatal.
    pub async fn init(config: &DetectorConfig) -> Result<Self, DetectorError> {
        let Some(ref endpoint) = config.endpoint else {
            info!("No detector endpoint configured, object detection disabled");
            return Ok(Self::disabled());
        };

        let detector = HttpDetector::new(endpoint, config)?;

        if let Err(e) = detector.probe().await {
            warn!(error = %e, endpoint = %endpoint, "Detector health probe failed");
        }

        info!(endpoint = %endpoint, "Object detector initialized");

        Ok(Self::with_backend(Arc::new(detector)))
    }

    pub fn disabled() -> Self {
        Self {
            backend: None,
            active: AtomicBool::new(true),
        }
    }

    pub fn with_backend(backend: Arc<dyn ObjectDetector>) -> Self {
        Self {
            backend: Some(backend),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some() && self.active.load(Ordering::Acquire)
    }

    /// Stop routing requests to the backend.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::AcqRel) && self.backend.is_some() {
            info!("Object detector shut down");
        }
    }

    pub async fn detect(&self, bytes: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let Some(ref backend) = self.backend else {
            return Ok(Vec::new());
        };

        if !self.active.load(Ordering::Acquire) {
            return Err(DetectorError::Unavailable);
        }

        backend.detect(bytes).await
    }
}
