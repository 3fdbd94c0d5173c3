use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use tracing::debug;

use super::backend::S3Backend;
use crate::config::Config;

/// An object listed under a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
}

pub struct S3Client {
    client: Client,
    pub config: Config,
}

impl S3Client {
    pub async fn new(config: Config) -> Result<Self> {
        let mut aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            aws_config = aws_config.profile_name(profile);
        }
        if let Some(endpoint) = &config.endpoint_url {
            debug!("Using endpoint {}", endpoint);
            aws_config = aws_config.endpoint_url(endpoint);
        }

        let sdk_config = aws_config.load().await;
        let client = Client::new(&sdk_config);

        Ok(Self { client, config })
    }

    /// Transfer backend sharing this client's connection pool
    pub fn backend(&self) -> S3Backend {
        S3Backend::new(self.client.clone())
    }

    /// All objects under `prefix`, following continuation tokens
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("Failed to list cos://{}/{}", bucket, prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                // Directory markers
                if key.ends_with('/') {
                    continue;
                }
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }

        debug!("Listed {} objects under cos://{}/{}", objects.len(), bucket, prefix);
        Ok(objects)
    }
}
