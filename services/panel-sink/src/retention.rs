use crate::error::SinkError;
use crate::object_store::{CannedAcl, ExpirationRule, ObjectStore};
use tracing::{info, instrument};

/// Lifecycle rule id attached to the panel bucket
pub const RETENTION_RULE_ID: &str = "retention-policy-24h";

/// Days an uploaded panel stays in the bucket
pub const RETENTION_DAYS: i32 = 1;

/// What bootstrapping found or did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketBootstrap {
    AlreadyExists,
    Created,
}

/// The expiration rule every panel bucket carries
pub fn retention_rule() -> ExpirationRule {
    ExpirationRule {
        id: RETENTION_RULE_ID.to_string(),
        expiration_days: RETENTION_DAYS,
        enabled: true,
    }
}

/// Make sure the bucket exists and expires its objects after a day.
///
/// An existing bucket is left untouched, including its lifecycle rules.
/// A new bucket is created public-read and then given the retention rule.
#[instrument(skip(store))]
pub async fn ensure_bucket(
    store: &dyn ObjectStore,
    bucket: &str,
) -> Result<BucketBootstrap, SinkError> {
    let bootstrap_error = |source| SinkError::Bootstrap {
        bucket: bucket.to_string(),
        source,
    };

    if store.bucket_exists(bucket).await.map_err(bootstrap_error)? {
        info!(bucket = %bucket, "Bucket already exists");
        return Ok(BucketBootstrap::AlreadyExists);
    }

    store
        .create_bucket(bucket, CannedAcl::PublicRead)
        .await
        .map_err(bootstrap_error)?;

    let rule = retention_rule();
    store
        .put_expiration_rule(bucket, &rule)
        .await
        .map_err(bootstrap_error)?;

    info!(
        bucket = %bucket,
        rule_id = %rule.id,
        expiration_days = rule.expiration_days,
        "Created bucket with retention policy"
    );

    Ok(BucketBootstrap::Created)
}
