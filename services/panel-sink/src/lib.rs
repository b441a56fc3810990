//! Grafana Panel Sink
//!
//! Streaming sink that publishes rendered Grafana dashboard panels. It consumes
//! PNG snapshots from the `aapen-grafana-paneler-v1` Kafka topic, keyed by
//! dashboard and panel, and uploads each one as a public-read object to the
//! `grafana-panels` S3 bucket, where a lifecycle rule expires it after a day.
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                                        S3 Bucket
//! ┌──────────────┐   ┌──────────────┐               ┌──────────────────┐
//! │ aapen-       │   │ Stream       │               │ grafana-panels   │
//! │ grafana-     │──▶│ Runtime      │               │   {dash}_{panel} │
//! │ paneler-v1   │   │ (workers)    │               │   .png (24h)     │
//! └──────────────┘   └──────────────┘               └──────────────────┘
//!                           │                               ▲
//!                           ▼                               │
//!                    ┌──────────────┐   ┌──────────────┐    │
//!                    │ Panel Key    │──▶│ Upload       │────┘
//!                    │ Codec        │   │ Pipeline     │
//!                    └──────────────┘   └──────────────┘
//! ```
//!
//! The retention bootstrapper runs once before consumption starts, and the
//! security selector decides once how the Kafka client authenticates.

pub mod config;
pub mod error;
pub mod http_api;
pub mod object_store;
pub mod panel_key;
pub mod retention;
pub mod security;
pub mod stream_runtime;
pub mod upload_pipeline;

pub use crate::config::Config;
pub use error::SinkError;
pub use http_api::AppState;
pub use object_store::{ObjectStore, S3ObjectStore, StoreError};
pub use panel_key::{KeyFormat, PanelKey};
pub use retention::{ensure_bucket, BucketBootstrap};
pub use security::{SecurityProfile, StreamSecurity};
pub use stream_runtime::{ErrorSink, LoggingErrorSink, RuntimeState, StreamRuntime};
pub use upload_pipeline::{UploadOutcome, UploadPipeline};
