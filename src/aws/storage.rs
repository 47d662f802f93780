//! S3 bucket manager.
//!
//! The provider's bucket listing cannot filter on tags server-side, so the
//! list path fetches every bucket's tag set individually. That scan is the
//! dominant latency cost and is tolerated as-is: a per-bucket tag-fetch
//! failure excludes that bucket from the result, it never fails the listing.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, PublicAccessBlockConfiguration, Tag,
    Tagging,
};
use aws_smithy_types_convert::date_time::DateTimeExt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::manager::{OpError, OpResult, ProviderError};
use crate::tags;

/// Flat bucket record; only the identifying fields survive normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, ProviderError>;
    async fn bucket_tags(&self, name: &str) -> Result<HashMap<String, String>, ProviderError>;
    async fn create_bucket(&self, name: &str) -> Result<(), ProviderError>;
    async fn put_tags(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;
    async fn set_public_access(&self, name: &str, public: bool) -> Result<(), ProviderError>;
    async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError>;
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>)
        -> Result<(), ProviderError>;
}

pub struct S3Storage {
    s3: aws_sdk_s3::Client,
    region: String,
}

impl S3Storage {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            s3: aws_sdk_s3::Client::new(config),
            region: super::resolved_region(config),
        }
    }
}

#[async_trait]
impl StorageApi for S3Storage {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, ProviderError> {
        let response = self
            .s3
            .list_buckets()
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        Ok(response
            .buckets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| {
                Some(Bucket {
                    name: b.name?,
                    created: b.creation_date.and_then(|d| d.to_chrono_utc().ok()),
                })
            })
            .collect())
    }

    async fn bucket_tags(&self, name: &str) -> Result<HashMap<String, String>, ProviderError> {
        let response = self
            .s3
            .get_bucket_tagging()
            .bucket(name)
            .send()
            .await
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))?;
        Ok(response
            .tag_set()
            .iter()
            .map(|t| (t.key().to_string(), t.value().to_string()))
            .collect())
    }

    async fn create_bucket(&self, name: &str) -> Result<(), ProviderError> {
        let mut request = self.s3.create_bucket().bucket(name);
        // us-east-1 is the global endpoint and rejects a LocationConstraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }

    async fn put_tags(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProviderError::Api(e.to_string()))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;
        self.s3
            .put_bucket_tagging()
            .bucket(name)
            .tagging(tagging)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }

    async fn set_public_access(&self, name: &str, public: bool) -> Result<(), ProviderError> {
        if public {
            self.s3
                .delete_public_access_block()
                .bucket(name)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
        } else {
            self.s3
                .put_public_access_block()
                .bucket(name)
                .public_access_block_configuration(
                    PublicAccessBlockConfiguration::builder()
                        .block_public_acls(true)
                        .ignore_public_acls(true)
                        .block_public_policy(true)
                        .restrict_public_buckets(true)
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
        }
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError> {
        self.s3
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                let not_empty = e
                    .as_service_error()
                    .map(|se| se.meta().code() == Some("BucketNotEmpty"))
                    .unwrap_or(false);
                if not_empty {
                    ProviderError::BucketNotEmpty
                } else {
                    ProviderError::Api(format!("{:?}", e.into_source()))
                }
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
    ) -> Result<(), ProviderError> {
        self.s3
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::Api(format!("{:?}", e.into_source())))
    }
}

pub struct StorageManager<A: StorageApi> {
    api: A,
}

impl StorageManager<S3Storage> {
    pub fn new(config: &SdkConfig) -> Self {
        Self::with_api(S3Storage::new(config))
    }
}

impl<A: StorageApi> StorageManager<A> {
    pub fn with_api(api: A) -> Self {
        Self { api }
    }

    /// Tag-filtered bulk scan. Unfetchable tag sets exclude the bucket.
    pub async fn list(&self) -> OpResult<Vec<Bucket>> {
        let buckets = self.api.list_buckets().await?;
        let mut owned = vec![];
        for bucket in buckets {
            match self.api.bucket_tags(&bucket.name).await {
                Ok(bucket_tags) if tags::is_owned(&bucket_tags) => owned.push(bucket),
                Ok(_) => {}
                Err(e) => {
                    debug!(bucket = %bucket.name, error = %e, "skipping bucket, tag fetch failed");
                }
            }
        }
        Ok(owned)
    }

    /// Creates, stamps the ownership tags, then applies the access posture.
    /// Buckets are private (block-all) unless explicitly made public.
    pub async fn create(&self, name: &str, public: bool) -> OpResult<()> {
        self.api.create_bucket(name).await?;
        self.api.put_tags(name, &tags::standard_tags()).await?;
        self.api.set_public_access(name, public).await?;
        info!(bucket = %name, %public, "bucket created");
        Ok(())
    }

    /// Ownership-checked delete. A non-empty bucket surfaces as its own
    /// error kind and is never emptied automatically.
    pub async fn delete(&self, name: &str) -> OpResult<()> {
        self.verify_owned(name).await?;
        self.api.delete_bucket(name).await?;
        info!(bucket = %name, "bucket deleted");
        Ok(())
    }

    pub async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>) -> OpResult<()> {
        self.verify_owned(bucket).await?;
        self.api.put_object(bucket, key, body).await?;
        info!(%bucket, %key, "object uploaded");
        Ok(())
    }

    async fn verify_owned(&self, name: &str) -> OpResult<()> {
        match self.api.bucket_tags(name).await {
            Ok(bucket_tags) if tags::is_owned(&bucket_tags) => Ok(()),
            Ok(_) => Err(OpError::AccessDenied),
            Err(_) => Err(OpError::AccessDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStorage {
        buckets: Vec<Bucket>,
        owned: HashSet<String>,
        tag_failures: HashSet<String>,
        not_empty: HashSet<String>,
        delete_calls: AtomicUsize,
        put_object_calls: AtomicUsize,
        stamped: Mutex<Vec<(String, BTreeMap<String, String>)>>,
        access: Mutex<Vec<(String, bool)>>,
    }

    fn bucket(name: &str) -> Bucket {
        Bucket {
            name: name.to_string(),
            created: None,
        }
    }

    #[async_trait]
    impl StorageApi for FakeStorage {
        async fn list_buckets(&self) -> Result<Vec<Bucket>, ProviderError> {
            Ok(self.buckets.clone())
        }

        async fn bucket_tags(&self, name: &str) -> Result<HashMap<String, String>, ProviderError> {
            if self.tag_failures.contains(name) {
                return Err(ProviderError::Api("access denied to tags".to_string()));
            }
            if self.owned.contains(name) {
                Ok(HashMap::from([(
                    tags::MARKER_KEY.to_string(),
                    tags::MARKER_VALUE.to_string(),
                )]))
            } else {
                Ok(HashMap::new())
            }
        }

        async fn create_bucket(&self, _name: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn put_tags(
            &self,
            name: &str,
            tags: &BTreeMap<String, String>,
        ) -> Result<(), ProviderError> {
            self.stamped
                .lock()
                .unwrap()
                .push((name.to_string(), tags.clone()));
            Ok(())
        }

        async fn set_public_access(&self, name: &str, public: bool) -> Result<(), ProviderError> {
            self.access.lock().unwrap().push((name.to_string(), public));
            Ok(())
        }

        async fn delete_bucket(&self, name: &str) -> Result<(), ProviderError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            if self.not_empty.contains(name) {
                return Err(ProviderError::BucketNotEmpty);
            }
            Ok(())
        }

        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: Vec<u8>,
        ) -> Result<(), ProviderError> {
            self.put_object_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn list_keeps_only_owned_buckets() {
        let fake = FakeStorage {
            buckets: vec![bucket("ours"), bucket("theirs")],
            owned: HashSet::from(["ours".to_string()]),
            ..Default::default()
        };
        let manager = StorageManager::with_api(fake);
        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "ours");
    }

    #[tokio::test]
    async fn tag_fetch_failure_excludes_bucket_without_failing_listing() {
        let fake = FakeStorage {
            buckets: vec![bucket("ours"), bucket("broken"), bucket("ours-2")],
            owned: HashSet::from(["ours".to_string(), "ours-2".to_string(), "broken".to_string()]),
            tag_failures: HashSet::from(["broken".to_string()]),
            ..Default::default()
        };
        let manager = StorageManager::with_api(fake);
        let listed = manager.list().await.unwrap();
        let names: Vec<_> = listed.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["ours", "ours-2"]);
    }

    #[tokio::test]
    async fn delete_foreign_bucket_is_denied_before_provider_call() {
        let fake = FakeStorage {
            buckets: vec![bucket("theirs")],
            ..Default::default()
        };
        let manager = StorageManager::with_api(fake);
        let err = manager.delete("theirs").await.unwrap_err();
        assert_eq!(err, OpError::AccessDenied);
        assert_eq!(manager.api.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_with_unfetchable_tags_is_denied() {
        let fake = FakeStorage {
            tag_failures: HashSet::from(["opaque".to_string()]),
            ..Default::default()
        };
        let manager = StorageManager::with_api(fake);
        assert_eq!(
            manager.delete("opaque").await.unwrap_err(),
            OpError::AccessDenied
        );
        assert_eq!(manager.api.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_empty_bucket_is_classified_distinctly() {
        let fake = FakeStorage {
            owned: HashSet::from(["full".to_string()]),
            not_empty: HashSet::from(["full".to_string()]),
            ..Default::default()
        };
        let manager = StorageManager::with_api(fake);
        let err = manager.delete("full").await.unwrap_err();
        assert_eq!(err, OpError::Provider(ProviderError::BucketNotEmpty));
        assert!(err.to_string().contains("not empty"));
    }

    #[tokio::test]
    async fn upload_to_foreign_bucket_is_denied() {
        let manager = StorageManager::with_api(FakeStorage::default());
        let err = manager
            .upload("theirs", "index.html", b"hello".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err, OpError::AccessDenied);
        assert_eq!(manager.api.put_object_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn create_stamps_marker_and_defaults_private() {
        let manager = StorageManager::with_api(FakeStorage::default());
        manager.create("fresh", false).await.unwrap();
        let stamped = manager.api.stamped.lock().unwrap();
        assert_eq!(stamped.len(), 1);
        assert_eq!(
            stamped[0].1.get(tags::MARKER_KEY).map(String::as_str),
            Some(tags::MARKER_VALUE)
        );
        let access = manager.api.access.lock().unwrap();
        assert_eq!(access.as_slice(), &[("fresh".to_string(), false)]);
    }
}
