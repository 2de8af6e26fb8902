//! Recognition Service
//!
//! Image ingestion and analysis service. A client uploads an image over
//! HTTP; the service computes coarse visual descriptors, asks an optional
//! object detector for labels, stores the original bytes in an
//! S3-compatible bucket and indexes a record in PostgreSQL.
//!
//! ## Features
//!
//! - **Feature Extraction**: Dimensions, format, dominant color, brightness
//!   band and per-channel means, computed locally from the decoded pixels
//! - **Optional Object Detection**: HTTP-backed detector; failures degrade
//!   to "no detections" instead of failing the upload
//! - **Blob Storage**: Bucket created on startup, multipart uploads for
//!   large images
//! - **Record Indexing**: Write-once records with id lookup and pagination
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API                   Orchestrator
//! ┌──────────────┐           ┌──────────────┐
//! │ POST /api/   │──────────▶│ validate     │
//! │   images/    │           │ analyze ─────┼──▶ Feature Extractor
//! └──────────────┘           │        └─────┼──▶ Object Detector
//!                            │ upload ──────┼──▶ Blob Store (S3)
//!                            │ persist ─────┼──▶ Record Store (PostgreSQL)
//!                            └──────────────┘
//! ```

pub mod analysis;
pub mod api;
pub mod blob_store;
pub mod config;
pub mod feature_extractor;
pub mod object_detector;
pub mod orchestrator;
pub mod record_store;

#[cfg(test)]
mod test_support;

pub use analysis::{AnalysisResult, DescriptorEntry};
pub use api::AppState;
pub use blob_store::{BlobStore, S3BlobStore, StorageError};
pub use config::Config;
pub use feature_extractor::{BrightnessLevel, DominantColor, FeatureDescriptor};
pub use object_detector::{Detection, DetectorHandle, HttpDetector, ObjectDetector};
pub use orchestrator::{IngestRequest, IngestionOrchestrator, PipelineError};
pub use record_store::{ImageRecord, PgRecordStore, RecordStore};

#[cfg(any(test, feature = "mock"))]
pub use blob_store::MemoryBlobStore;
#[cfg(any(test, feature = "mock"))]
pub use record_store::MemoryRecordStore;
