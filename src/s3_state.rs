use crate::liveness::NodeStatus;
use crate::store::{status_key, BlobStore, StatusStore};
use crate::WarcannonError;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{primitives::ByteStream, Client};
use tracing::warn;

/// S3-backed snapshot and heartbeat storage.
#[derive(Clone)]
pub struct S3State {
    client: Client,
    bucket: String,
    prefix: String,
    status_prefix: String,
}

#[derive(Clone, Debug)]
pub struct S3StateConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub status_prefix: String,
    pub endpoint: Option<String>,
}

impl S3StateConfig {
    pub fn new(bucket: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            prefix: String::new(),
            status_prefix: "status".to_string(),
            endpoint: None,
        }
    }
}

impl S3State {
    pub async fn connect(config: S3StateConfig) -> Result<Self, WarcannonError> {
        if config.bucket.is_empty() {
            return Err(WarcannonError::Config("S3 bucket not set".to_string()));
        }
        let region = Region::new(config.region.clone());
        let base_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint);
            s3_builder = s3_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket,
            prefix: config.prefix.trim_end_matches('/').to_string(),
            status_prefix: config.status_prefix,
        })
    }

    fn prefixed(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return key;
        }
        key.strip_prefix(&self.prefix)
            .map(|k| k.trim_start_matches('/'))
            .unwrap_or(key)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, WarcannonError> {
        let mut token: Option<String> = None;
        let mut keys = Vec::new();
        let prefixed_prefix = self.prefixed(prefix);

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefixed_prefix.clone());
            if let Some(ref cont) = token {
                request = request.continuation_token(cont);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| WarcannonError::Storage(format!("S3 list {}: {}", prefix, e)))?;
            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .map(|k| self.strip_prefix(k).to_string()),
            );

            if resp.is_truncated().unwrap_or(false) {
                token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for S3State {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), WarcannonError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.prefixed(key))
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| WarcannonError::Storage(format!("S3 put {}: {}", key, e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, WarcannonError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.prefixed(key))
            .send()
            .await
            .map_err(|e| WarcannonError::Storage(format!("S3 get {}: {}", key, e)))?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| WarcannonError::Storage(format!("S3 read {}: {}", key, e)))?;
        Ok(data.into_bytes().to_vec())
    }
}

#[async_trait]
impl StatusStore for S3State {
    async fn put_status(&self, status: &NodeStatus) -> Result<(), WarcannonError> {
        let bytes = serde_json::to_vec(status)?;
        self.put(&status_key(&self.status_prefix, &status.instance_id), bytes, "application/json")
            .await
    }

    async fn scan(&self) -> Result<Vec<NodeStatus>, WarcannonError> {
        let mut statuses = Vec::new();
        for key in self.list_keys(&format!("{}/", self.status_prefix)).await? {
            if !key.ends_with(".json") {
                continue;
            }
            let bytes = self.get(&key).await?;
            match serde_json::from_slice::<NodeStatus>(&bytes) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(%key, error = %e, "skipping unreadable status record"),
            }
        }
        Ok(statuses)
    }
}
