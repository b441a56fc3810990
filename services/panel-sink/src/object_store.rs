use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketCannedAcl, BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration,
    LifecycleRule, LifecycleRuleFilter, ObjectCannedAcl,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors returned by object store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("Invalid {operation} request: {message}")]
    InvalidRequest {
        operation: &'static str,
        message: String,
    },
}

/// Canned access control applied to buckets and objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedAcl {
    Private,
    PublicRead,
}

/// Lifecycle rule expiring every object in a bucket after a fixed age
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirationRule {
    pub id: String,
    pub expiration_days: i32,
    pub enabled: bool,
}

/// A single object upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectRequest {
    pub key: String,
    pub body: Bytes,
    pub content_length: i64,
    /// Base64 encoded MD5 of the body
    pub content_md5: String,
    pub content_type: &'static str,
    pub acl: CannedAcl,
}

/// Operations the sink needs from an S3-compatible object store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single round trip existence check
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    async fn create_bucket(&self, bucket: &str, acl: CannedAcl) -> Result<(), StoreError>;

    /// Replace the bucket lifecycle configuration with a single expiration rule
    async fn put_expiration_rule(
        &self,
        bucket: &str,
        rule: &ExpirationRule,
    ) -> Result<(), StoreError>;

    async fn put_object(&self, bucket: &str, request: PutObjectRequest) -> Result<(), StoreError>;
}

/// Object store backed by the AWS S3 SDK
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a client for the configured endpoint with static credentials
    pub async fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "panel-sink-static",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        // Path-style addressing for Ceph/MinIO style endpoints
        let s3_config = S3ConfigBuilder::from(&aws_config)
            .endpoint_url(&config.url)
            .force_path_style(true)
            .build();

        info!(
            endpoint = %config.url,
            region = %config.region,
            "S3 client initialized"
        );

        Self {
            client: S3Client::from_conf(s3_config),
        }
    }
}

fn request_error<E>(operation: &'static str, error: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Request {
        operation,
        message: DisplayErrorContext(error).to_string(),
    }
}

fn bucket_acl(acl: CannedAcl) -> BucketCannedAcl {
    match acl {
        CannedAcl::Private => BucketCannedAcl::Private,
        CannedAcl::PublicRead => BucketCannedAcl::PublicRead,
    }
}

fn object_acl(acl: CannedAcl) -> ObjectCannedAcl {
    match acl {
        CannedAcl::Private => ObjectCannedAcl::Private,
        CannedAcl::PublicRead => ObjectCannedAcl::PublicRead,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                    || e.raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);

                if not_found {
                    Ok(false)
                } else {
                    Err(request_error("HeadBucket", e))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str, acl: CannedAcl) -> Result<(), StoreError> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .acl(bucket_acl(acl))
            .send()
            .await
            .map_err(|e| request_error("CreateBucket", e))?;

        debug!(bucket = %bucket, "Bucket created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_expiration_rule(
        &self,
        bucket: &str,
        rule: &ExpirationRule,
    ) -> Result<(), StoreError> {
        let status = if rule.enabled {
            ExpirationStatus::Enabled
        } else {
            ExpirationStatus::Disabled
        };

        // An empty prefix matches every object in the bucket
        let lifecycle_rule = LifecycleRule::builder()
            .id(&rule.id)
            .filter(LifecycleRuleFilter::builder().prefix("").build())
            .status(status)
            .expiration(
                LifecycleExpiration::builder()
                    .days(rule.expiration_days)
                    .build(),
            )
            .build()
            .map_err(|e| StoreError::InvalidRequest {
                operation: "PutBucketLifecycleConfiguration",
                message: e.to_string(),
            })?;

        let lifecycle = BucketLifecycleConfiguration::builder()
            .rules(lifecycle_rule)
            .build()
            .map_err(|e| StoreError::InvalidRequest {
                operation: "PutBucketLifecycleConfiguration",
                message: e.to_string(),
            })?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket)
            .lifecycle_configuration(lifecycle)
            .send()
            .await
            .map_err(|e| request_error("PutBucketLifecycleConfiguration", e))?;

        Ok(())
    }

    #[instrument(skip(self, request), fields(key = %request.key, size_bytes = request.content_length))]
    async fn put_object(&self, bucket: &str, request: PutObjectRequest) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(request.key)
            .body(ByteStream::from(request.body))
            .content_length(request.content_length)
            .content_md5(request.content_md5)
            .content_type(request.content_type)
            .acl(object_acl(request.acl))
            .send()
            .await
            .map_err(|e| request_error("PutObject", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_mapping() {
        assert_eq!(bucket_acl(CannedAcl::PublicRead), BucketCannedAcl::PublicRead);
        assert_eq!(object_acl(CannedAcl::PublicRead), ObjectCannedAcl::PublicRead);
        assert_eq!(object_acl(CannedAcl::Private), ObjectCannedAcl::Private);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Request {
            operation: "PutObject",
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "PutObject failed: connection refused");
    }
}
