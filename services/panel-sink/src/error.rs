use crate::object_store::StoreError;
use rdkafka::error::KafkaError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning panel records into stored objects
#[derive(Error, Debug)]
pub enum SinkError {
    /// Record key is missing, not UTF-8, has no `:` or `_` separator, or has an
    /// empty side
    #[error("Malformed panel key {key:?}: expected \"<dashboard>:<panel>\" or \"<dashboard>_<panel>\"")]
    MalformedKey { key: String },

    /// Record value could not be read at the log-client layer
    #[error("Failed to deserialize record at partition {partition}, offset {offset}: {reason}")]
    Deserialization {
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("Failed to upload object {object_name}: {source}")]
    Upload {
        object_name: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to bootstrap bucket {bucket}: {source}")]
    Bootstrap {
        bucket: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to configure truststore {path:?}: {reason}")]
    Truststore { path: PathBuf, reason: String },

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Stream runtime cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Stream worker panicked: {0}")]
    WorkerPanicked(String),
}

impl SinkError {
    /// Whether the error should take down the worker that hit it
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(
            self,
            SinkError::Deserialization { .. } | SinkError::WorkerPanicked(_)
        )
    }
}
