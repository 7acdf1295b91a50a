//! S3-backed `StagingStore` (§6: "object-store client library" is an
//! external collaborator; this is the thin adapter that satisfies
//! `redshift_core::StagingStore` against the real `object_store`
//! crate).

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::warn;

use redshift_core::config::Config;
use redshift_core::error::{Result, TargetError};
use redshift_core::traits::StagingStore;

use crate::retry::retry_transient;

pub struct S3StagingStore {
    client: Box<dyn ObjectStore>,
    bucket: String,
}

impl S3StagingStore {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.s3_bucket);

        if let Some(region) = &config.s3_region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        if let Some(arn) = &config.aws_redshift_copy_role_arn {
            // The COPY command assumes this role itself; the staging
            // client still needs its own credentials to put/delete.
            let _ = arn;
        }
        if let (Some(key), Some(secret)) = (&config.aws_access_key_id, &config.aws_secret_access_key) {
            builder = builder
                .with_access_key_id(key)
                .with_secret_access_key(secret);
            if let Some(token) = &config.aws_session_token {
                builder = builder.with_token(token);
            }
        } else if let Some(profile) = &config.aws_profile {
            // object_store has no native profile support; surface it
            // through the environment the way the AWS CLI/SDKs do.
            std::env::set_var("AWS_PROFILE", profile);
        }

        let client = builder.build().map_err(|e| TargetError::Fatal(e.into()))?;
        Ok(Self {
            client: Box::new(client),
            bucket: config.s3_bucket.clone(),
        })
    }
}

#[async_trait]
impl StagingStore for S3StagingStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String> {
        let path = ObjectPath::from(key);
        let payload = bytes::Bytes::from(bytes);
        retry_transient(key, "s3_put", || {
            let client = &self.client;
            let path = path.clone();
            let payload = payload.clone();
            async move {
                client
                    .put(&path, payload)
                    .await
                    .map_err(anyhow::Error::from)
            }
        })
        .await?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = ObjectPath::from(key);
        match self.client.delete(&path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(key, error = %e, "failed to delete staged object; leaving it behind");
                Ok(())
            }
        }
    }
}
