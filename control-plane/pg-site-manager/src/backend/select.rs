use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::ByteString;

/// Managed-cloud coordinates found in the namespace.
#[derive(Clone, PartialEq, Eq)]
pub struct CloudSqlDiscovery {
    pub project: String,
    pub region: String,
    /// Service-account key JSON.
    pub credentials: Vec<u8>,
}

impl fmt::Debug for CloudSqlDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSqlDiscovery")
            .field("project", &self.project)
            .field("region", &self.region)
            .field("credentials", &format_args!("<{} bytes>", self.credentials.len()))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    SelfManaged,
    ManagedCloud(CloudSqlDiscovery),
}

/// Managed-cloud needs `project` and `region` in the config map and a
/// non-empty credentials secret; anything less falls back to self-managed.
pub fn choose_backend(
    config: Option<&BTreeMap<String, String>>,
    secret: Option<&BTreeMap<String, ByteString>>,
    credentials_key: &str,
) -> BackendKind {
    let non_empty = |m: &BTreeMap<String, String>, k: &str| {
        m.get(k).filter(|v| !v.is_empty()).cloned()
    };
    let Some(cfg) = config else {
        return BackendKind::SelfManaged;
    };
    let (Some(project), Some(region)) = (non_empty(cfg, "project"), non_empty(cfg, "region"))
    else {
        return BackendKind::SelfManaged;
    };
    let credentials = secret.and_then(|data| {
        data.get(credentials_key)
            .filter(|v| !v.0.is_empty())
            .or_else(|| data.values().find(|v| !v.0.is_empty()))
            .map(|v| v.0.clone())
    });
    match credentials {
        Some(credentials) => BackendKind::ManagedCloud(CloudSqlDiscovery {
            project,
            region,
            credentials,
        }),
        None => BackendKind::SelfManaged,
    }
}
