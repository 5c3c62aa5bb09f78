use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use csi_s3_types::error::Result;
use csi_s3_types::DriverError;

/// Abstraction over the S3-compatible bucket operations the Dynamic-Provisioning Controller
/// (C8) needs, so `provisioning.rs`'s decision logic can be unit-tested against an in-memory
/// fake instead of live object storage — the same pattern as [`crate::attachment_store`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(&self, name: &str, region: &str) -> Result<()>;
    async fn bucket_is_empty(&self, name: &str) -> Result<bool>;
    async fn delete_bucket(&self, name: &str) -> Result<()>;
    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()>;
    async fn bucket_exists(&self, name: &str) -> Result<bool>;
}

pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn create_bucket(&self, name: &str, region: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(name);
        if region != "us-east-1" {
            let constraint = aws_sdk_s3::types::BucketLocationConstraint::from(region);
            let config = aws_sdk_s3::types::CreateBucketConfiguration::builder()
                .location_constraint(constraint)
                .build();
            request = request.create_bucket_configuration(config);
        }
        request
            .send()
            .await
            .map_err(|e| DriverError::Internal(format!("create_bucket {name}: {e}")))?;
        Ok(())
    }

    async fn bucket_is_empty(&self, name: &str) -> Result<bool> {
        let listing = self
            .client
            .list_objects_v2()
            .bucket(name)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| DriverError::Internal(format!("list_objects_v2 {name}: {e}")))?;
        Ok(listing.key_count().unwrap_or(0) == 0)
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| DriverError::Internal(format!("delete_bucket {name}: {e}")))?;
        Ok(())
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
        let mut continuation = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let listing = request
                .send()
                .await
                .map_err(|e| DriverError::Internal(format!("list_objects_v2 {bucket}/{prefix}: {e}")))?;

            for object in listing.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| DriverError::Internal(format!("delete_object {bucket}/{key}: {e}")))?;
                }
            }

            if listing.is_truncated().unwrap_or(false) {
                continuation = listing.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn bucket_exists(&self, name: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(true),
            Err(aws_sdk_s3::error::SdkError::ServiceError(e)) if e.raw().status().as_u16() == 404 => Ok(false),
            Err(e) => Err(DriverError::Internal(format!("head_bucket {name}: {e}"))),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeObjectStore {
        // bucket -> set of object keys
        buckets: Mutex<HashMap<String, HashSet<String>>>,
    }

    impl FakeObjectStore {
        pub fn seed_existing_bucket(&self, name: &str, keys: &[&str]) {
            self.buckets
                .lock()
                .unwrap()
                .insert(name.to_owned(), keys.iter().map(|k| k.to_string()).collect());
        }
    }

    #[async_trait]
    impl ObjectStore for FakeObjectStore {
        async fn create_bucket(&self, name: &str, _region: &str) -> Result<()> {
            self.buckets.lock().unwrap().entry(name.to_owned()).or_default();
            Ok(())
        }

        async fn bucket_is_empty(&self, name: &str) -> Result<bool> {
            Ok(self.buckets.lock().unwrap().get(name).map_or(true, HashSet::is_empty))
        }

        async fn delete_bucket(&self, name: &str) -> Result<()> {
            self.buckets.lock().unwrap().remove(name);
            Ok(())
        }

        async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<()> {
            if let Some(keys) = self.buckets.lock().unwrap().get_mut(bucket) {
                keys.retain(|k| !k.starts_with(prefix));
            }
            Ok(())
        }

        async fn bucket_exists(&self, name: &str) -> Result<bool> {
            Ok(self.buckets.lock().unwrap().contains_key(name))
        }
    }
}
