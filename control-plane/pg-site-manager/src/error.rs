use thiserror::Error;

pub type Result<T, E = SiteManagerError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SiteManagerError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("PostgreSQL at {host} is unreachable: {reason}")]
    DatabaseUnavailable { host: String, reason: String },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mode {0} not supported")]
    UnsupportedMode(String),

    #[error("pre-configure is not supported by the {0} backend")]
    PreConfigureUnsupported(&'static str),

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("cluster is not healthy: {0}")]
    Unhealthy(String),

    #[error("reconcile status failed, fix the cluster and try again")]
    ReconcileFailed,

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("provider request failed with status {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("provider operation {operation} failed: {message}")]
    Operation { operation: String, message: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SiteManagerError {
    pub fn timeout(what: impl Into<String>, after: std::time::Duration) -> Self {
        SiteManagerError::Timeout {
            what: what.into(),
            secs: after.as_secs(),
        }
    }

    /// True for optimistic-concurrency rejections from the API server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SiteManagerError::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}
