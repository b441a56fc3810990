use crate::error::SinkError;
use crate::object_store::{CannedAcl, ObjectStore, PutObjectRequest};
use crate::panel_key::PanelKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

/// Content type of rendered panels
const PANEL_CONTENT_TYPE: &str = "image/png";

/// Result of handling one panel. Upload failures are reported here and never
/// surface as an `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: usize },
    Failed,
}

/// Base64 encoded MD5 digest, as sent in the `Content-MD5` header
pub fn content_md5(payload: &[u8]) -> String {
    STANDARD.encode(md5::compute(payload).0)
}

/// Build the public-read upload for one panel snapshot
pub fn panel_upload(key: &PanelKey, payload: Bytes) -> PutObjectRequest {
    PutObjectRequest {
        key: key.object_name(),
        content_length: payload.len() as i64,
        content_md5: content_md5(&payload),
        content_type: PANEL_CONTENT_TYPE,
        acl: CannedAcl::PublicRead,
        body: payload,
    }
}

/// Publishes panel snapshots to the panel bucket
pub struct UploadPipeline {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl UploadPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Upload one panel snapshot.
    ///
    /// The dashboard id and panel name are attached to every log line emitted
    /// while the upload is in flight.
    #[instrument(
        name = "panel_upload",
        skip(self, key, payload),
        fields(dashboard_id = %key.dashboard_id, panel_name = %key.panel_name)
    )]
    pub async fn handle(&self, key: &PanelKey, payload: Bytes) -> UploadOutcome {
        let size_bytes = payload.len();
        info!(size_bytes, "Received panel snapshot");

        let request = panel_upload(key, payload);
        let object_name = request.key.clone();
        let started = Instant::now();

        match self.store.put_object(&self.bucket, request).await {
            Ok(()) => {
                metrics::histogram!("panel_sink_upload_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                metrics::counter!("panel_sink_uploads_total", "outcome" => "success").increment(1);
                metrics::counter!("panel_sink_uploaded_bytes_total").increment(size_bytes as u64);

                info!(
                    size_bytes,
                    object = %object_name,
                    "Uploaded panel snapshot"
                );
                UploadOutcome::Uploaded { bytes: size_bytes }
            }
            Err(source) => {
                metrics::counter!("panel_sink_uploads_total", "outcome" => "failure").increment(1);

                let e = SinkError::Upload {
                    object_name,
                    source,
                };
                error!(error = %e, "Error while uploading panel snapshot");
                UploadOutcome::Failed
            }
        }
    }
}
