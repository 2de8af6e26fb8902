//! Ingestion orchestrator.
//!
//! Drives one upload through `Start -> IdGenerated -> Analyzed -> Uploaded
//! -> Persisted`. Analysis runs before anything is written, so invalid
//! input and undecodable images leave no trace. The blob upload and the
//! record insert are separate calls without a shared transaction: if the
//! insert fails the uploaded blob stays behind, unreferenced. That case is
//! reported as [`PipelineError::PersistenceFailed`], logged with the
//! orphaned key and counted in `ingestion.blobs.orphaned`.

use crate::analysis::{self, AnalysisResult};
use crate::blob_store::{object_key, BlobStore, BlobUpload, StorageError};
use crate::feature_extractor::{self, ExtractionError};
use crate::object_detector::{Detection, DetectorError, DetectorHandle};
use crate::record_store::{ImageRecord, PersistenceError, RecordStore};
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced by the pipeline. Detector failures never appear here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("File must be an image")]
    InvalidInput { content_type: String },

    #[error("Image analysis failed: {0}")]
    AnalysisFailed(#[from] ExtractionError),

    #[error("Storage error: {0}")]
    StorageFailed(#[from] StorageError),

    #[error("Failed to persist image record {id}: {source}")]
    PersistenceFailed {
        id: Uuid,
        orphaned_key: String,
        source: PersistenceError,
    },

    #[error("Image not found")]
    NotFound,

    #[error("Failed to read image records: {0}")]
    Read(#[source] PersistenceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short machine-readable reason, used for metric labels and error codes
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput { .. } => "invalid_input",
            PipelineError::AnalysisFailed(_) => "analysis_failed",
            PipelineError::StorageFailed(_) => "storage_failed",
            PipelineError::PersistenceFailed { .. } => "persistence_failed",
            PipelineError::NotFound => "not_found",
            PipelineError::Read(_) => "read_failed",
            PipelineError::Internal(_) => "internal",
        }
    }
}

/// Where an ingestion currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionStage {
    Start,
    IdGenerated,
    Analyzed,
    Uploaded,
    Persisted,
    /// Blob uploaded but the record insert failed
    PartiallyPersisted,
}

impl fmt::Display for IngestionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestionStage::Start => "start",
            IngestionStage::IdGenerated => "id_generated",
            IngestionStage::Analyzed => "analyzed",
            IngestionStage::Uploaded => "uploaded",
            IngestionStage::Persisted => "persisted",
            IngestionStage::PartiallyPersisted => "partially_persisted",
        };
        f.write_str(name)
    }
}

/// An uploaded image awaiting ingestion
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub filename: String,
    /// Content type declared by the client
    pub content_type: String,
    pub bytes: Bytes,
}

/// Reachability of the backing stores
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub database_error: Option<String>,
    pub storage_error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.database_error.is_none() && self.storage_error.is_none()
    }
}

/// Coordinates analysis, blob upload and record persistence
pub struct IngestionOrchestrator {
    blob_store: Arc<dyn BlobStore>,
    record_store: Arc<dyn RecordStore>,
    detector: Arc<DetectorHandle>,
}

impl IngestionOrchestrator {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        record_store: Arc<dyn RecordStore>,
        detector: Arc<DetectorHandle>,
    ) -> Self {
        Self {
            blob_store,
            record_store,
            detector,
        }
    }

    /// Ingest one image and return the persisted record.
    ///
    /// Retrying after a failure is safe: every call allocates a new id and
    /// a new blob key, nothing is overwritten.
    #[instrument(
        skip(self, request),
        fields(filename = %request.filename, size_bytes = request.bytes.len())
    )]
    pub async fn ingest(&self, request: IngestRequest) -> Result<ImageRecord, PipelineError> {
        let started = Instant::now();
        let result = self.run(request).await;

        metrics::histogram!("ingestion.duration_seconds").record(started.elapsed().as_secs_f64());
        match result {
            Ok(_) => metrics::counter!("ingestion.completed").increment(1),
            Err(ref e) => {
                metrics::counter!("ingestion.failed", "reason" => e.reason()).increment(1)
            }
        }

        result
    }

    async fn run(&self, request: IngestRequest) -> Result<ImageRecord, PipelineError> {
        if !is_image_content_type(&request.content_type) {
            warn!(
                content_type = %request.content_type,
                stage = %IngestionStage::Start,
                "Rejecting non-image upload"
            );
            metrics::counter!("ingestion.requests.rejected").increment(1);
            return Err(PipelineError::InvalidInput {
                content_type: request.content_type,
            });
        }
        metrics::counter!("ingestion.requests.accepted").increment(1);

        let id = Uuid::new_v4();
        debug!(image_id = %id, stage = %IngestionStage::IdGenerated, "Ingestion started");

        let analysis = self.analyze(request.bytes.clone()).await.map_err(|e| {
            warn!(
                image_id = %id,
                from = %IngestionStage::IdGenerated,
                error = %e,
                "Ingestion failed"
            );
            e
        })?;
        let recognition_result = match analysis.to_json() {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(image_id = %id, error = %e, "Failed to serialize analysis, storing none");
                None
            }
        };
        debug!(
            image_id = %id,
            stage = %IngestionStage::Analyzed,
            detections = analysis.detections.len(),
            "Image analyzed"
        );

        let key = object_key(id, &request.filename);
        let object_url = self
            .blob_store
            .upload(BlobUpload {
                key: key.clone(),
                body: request.bytes,
                content_type: request.content_type,
                metadata: vec![("image-id".to_string(), id.to_string())],
            })
            .await
            .map_err(|e| {
                warn!(
                    image_id = %id,
                    from = %IngestionStage::Analyzed,
                    error = %e,
                    "Ingestion failed"
                );
                PipelineError::from(e)
            })?;
        debug!(image_id = %id, stage = %IngestionStage::Uploaded, key = %key, "Image uploaded");

        let record = ImageRecord {
            id,
            filename: request.filename,
            // Postgres keeps microseconds; truncate so reads return the same value
            upload_time: Utc::now().trunc_subsecs(6),
            recognition_result,
            object_url,
        };

        if let Err(source) = self.record_store.insert(&record).await {
            metrics::counter!("ingestion.blobs.orphaned").increment(1);
            error!(
                image_id = %id,
                orphaned_key = %key,
                stage = %IngestionStage::PartiallyPersisted,
                error = %source,
                "Record insert failed after upload, blob left without a record"
            );
            return Err(PipelineError::PersistenceFailed {
                id,
                orphaned_key: key,
                source,
            });
        }

        info!(
            image_id = %id,
            stage = %IngestionStage::Persisted,
            object_url = %record.object_url,
            "Image ingested"
        );

        Ok(record)
    }

    /// Extract features and detect objects concurrently, then merge
    async fn analyze(&self, bytes: Bytes) -> Result<AnalysisResult, PipelineError> {
        let extraction = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || feature_extractor::extract(&bytes))
        };

        let (extracted, detected) = tokio::join!(extraction, self.detector.detect(&bytes));

        let descriptor = extracted
            .map_err(|e| PipelineError::Internal(format!("feature extraction task failed: {e}")))??;

        Ok(analysis::merge(&descriptor, detections_or_empty(detected)))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<ImageRecord, PipelineError> {
        self.record_store
            .get(id)
            .await
            .map_err(PipelineError::Read)?
            .ok_or(PipelineError::NotFound)
    }

    pub async fn list(&self, offset: u32, limit: u32) -> Result<Vec<ImageRecord>, PipelineError> {
        self.record_store
            .list(offset, limit)
            .await
            .map_err(PipelineError::Read)
    }

    /// Probe the record store with a round trip and the blob store for its bucket
    pub async fn check_health(&self) -> HealthReport {
        let database_error = self.record_store.ping().await.err().map(|e| e.to_string());

        let storage_error = match self.blob_store.container_exists().await {
            Ok(true) => None,
            Ok(false) => Some("Bucket not found".to_string()),
            Err(e) => Some(e.to_string()),
        };

        HealthReport {
            database_error,
            storage_error,
        }
    }
}

/// Detector failures degrade to "no detections" and never fail ingestion
fn detections_or_empty(result: Result<Vec<Detection>, DetectorError>) -> Vec<Detection> {
    result.unwrap_or_else(|e| {
        warn!(error = %e, "Object detection failed, continuing without detections");
        metrics::counter!("detector.failures").increment(1);
        Vec::new()
    })
}

/// Declared content type must be `image/<subtype>`
fn is_image_content_type(content_type: &str) -> bool {
    let content_type = content_type.trim().to_ascii_lowercase();
    content_type
        .strip_prefix("image/")
        .map(|subtype| !subtype.is_empty())
        .unwrap_or(false)
}
