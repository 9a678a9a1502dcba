use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::auth::TokenSource;
use super::types::{DatabaseInstance, InstancesListResponse, Operation};
use crate::error::{Result, SiteManagerError};

/// Managed-database control plane.
///
/// Non-2xx answers surface as [`SiteManagerError::Provider`] carrying the
/// HTTP status, so callers can treat 304 and 409 specially.
#[async_trait]
pub trait ManagedDbProvider: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>>;
    async fn insert_instance(&self, instance: &DatabaseInstance) -> Result<Operation>;
    async fn delete_instance(&self, name: &str) -> Result<Operation>;
    async fn promote_replica(&self, name: &str) -> Result<Operation>;
    async fn patch_instance(&self, name: &str, patch: &DatabaseInstance) -> Result<Operation>;
    async fn get_operation(&self, name: &str) -> Result<Operation>;
}

#[derive(Clone)]
pub struct SqlAdminClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    tokens: Arc<dyn TokenSource>,
}

impl SqlAdminClient {
    /// `base_url` is the API root without version, e.g.
    /// `https://sqladmin.googleapis.com/sql`.
    pub fn new(
        base_url: impl Into<String>,
        project: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/projects/{}/{}", self.base_url, self.project, path)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.tokens.token().await?;
        Ok(self.http.request(method, self.url(path)).bearer_auth(token))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    debug!(status = status.as_u16(), %message, "Cloud SQL Admin API error");
    Err(SiteManagerError::Provider {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ManagedDbProvider for SqlAdminClient {
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>> {
        let req = self.request(Method::GET, "instances").await?;
        let list: InstancesListResponse = self.send(req).await?;
        Ok(list.items)
    }

    async fn insert_instance(&self, instance: &DatabaseInstance) -> Result<Operation> {
        let req = self.request(Method::POST, "instances").await?.json(instance);
        self.send(req).await
    }

    async fn delete_instance(&self, name: &str) -> Result<Operation> {
        let req = self
            .request(Method::DELETE, &format!("instances/{name}"))
            .await?;
        self.send(req).await
    }

    async fn promote_replica(&self, name: &str) -> Result<Operation> {
        let req = self
            .request(Method::POST, &format!("instances/{name}/promoteReplica"))
            .await?;
        self.send(req).await
    }

    async fn patch_instance(&self, name: &str, patch: &DatabaseInstance) -> Result<Operation> {
        let req = self
            .request(Method::PATCH, &format!("instances/{name}"))
            .await?
            .json(patch);
        self.send(req).await
    }

    async fn get_operation(&self, name: &str) -> Result<Operation> {
        let req = self
            .request(Method::GET, &format!("operations/{name}"))
            .await?;
        self.send(req).await
    }
}
