use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health::ClusterSnapshot;
use crate::poll::retry_with_timeout;

/// The clustering layer's REST API.
#[async_trait]
pub trait CoordinationApi: Send + Sync {
    async fn cluster(&self) -> Result<ClusterSnapshot>;

    /// Merge `patch` into the dynamic cluster configuration.
    async fn patch_config(&self, patch: &Value) -> Result<()>;
}

/// Dynamic-config patch turning the cluster into a replica of `host:port`.
pub fn standby_cluster_patch(host: &str, port: u16, slot_name: &str) -> Value {
    json!({
        "standby_cluster": {
            "host": host,
            "port": port,
            "primary_slot_name": slot_name,
            "create_replica_methods": ["basebackup"],
        }
    })
}

/// Null removes the key under Patroni's merge semantics.
pub fn clear_standby_cluster_patch() -> Value {
    json!({ "standby_cluster": null })
}

#[derive(Clone)]
pub struct PatroniClient {
    http: reqwest::Client,
    base_url: String,
    retry_interval: Duration,
    retry_timeout: Duration,
}

impl PatroniClient {
    /// `base_url` must end with `/`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            retry_interval: Duration::from_secs(1),
            retry_timeout: Duration::from_secs(60),
        })
    }

    pub fn with_retry(mut self, interval: Duration, timeout: Duration) -> Self {
        self.retry_interval = interval;
        self.retry_timeout = timeout;
        self
    }

    async fn send_patch(&self, patch: &Value) -> Result<()> {
        self.http
            .patch(format!("{}config", self.base_url))
            .json(patch)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationApi for PatroniClient {
    async fn cluster(&self) -> Result<ClusterSnapshot> {
        let url = format!("{}cluster", self.base_url);
        let snapshot = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<ClusterSnapshot>()
            .await?;
        debug!(members = snapshot.members.len(), "Fetched Patroni cluster");
        Ok(snapshot)
    }

    async fn patch_config(&self, patch: &Value) -> Result<()> {
        info!(%patch, "Patching Patroni dynamic configuration");
        retry_with_timeout(
            self.retry_interval,
            self.retry_timeout,
            move || async move {
                let res = self.send_patch(patch).await;
                if let Err(e) = &res {
                    warn!(error = %e, "Failed to patch Patroni config, retrying");
                }
                res
            },
            |_| true,
        )
        .await
    }
}
