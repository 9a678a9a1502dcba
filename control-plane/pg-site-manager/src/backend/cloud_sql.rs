use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};
use tracing::{error, info, instrument, warn};

use super::SiteBackend;
use crate::clients::DatabaseOps;
use crate::cloudsql::{
    CLOUD_SQL_INSTANCE, DatabaseInstance, ManagedDbProvider, Operation, READ_REPLICA_INSTANCE,
    STATE_RUNNABLE, Settings,
};
use crate::config::Timings;
use crate::error::{Result, SiteManagerError};
use crate::k8s::ProxyControl;
use crate::poll::{poll_with_timeout, retry_with_timeout};
use crate::sitemanager::{HealthStatus, Mode, ModeChangeRequest};

const NAMESPACE_LABEL: &str = "namespace";
const REGIONAL_AVAILABILITY: &str = "REGIONAL";

#[derive(Clone, Debug)]
pub struct CloudSqlSettings {
    /// Region this site runs in.
    pub region: String,
    /// Instances are matched by their `namespace` user label.
    pub namespace: String,
    /// Service name of the connection proxy, used for SQL-level work.
    pub proxy_host: String,
}

/// Managed-cloud strategy backed by the Cloud SQL Admin API.
pub struct CloudSqlBackend {
    settings: CloudSqlSettings,
    provider: Arc<dyn ManagedDbProvider>,
    database: Arc<dyn DatabaseOps>,
    proxy: Arc<dyn ProxyControl>,
    timings: Timings,
}

fn owned_by<'a>(
    instances: &'a [DatabaseInstance],
    namespace: &'a str,
) -> impl Iterator<Item = &'a DatabaseInstance> {
    instances
        .iter()
        .filter(move |i| i.label(NAMESPACE_LABEL) == Some(namespace))
}

/// First instance of `instance_type` in `region` owned by `namespace`.
pub(crate) fn local_of_type<'a>(
    instances: &'a [DatabaseInstance],
    region: &str,
    namespace: &'a str,
    instance_type: &str,
) -> Option<&'a DatabaseInstance> {
    owned_by(instances, namespace).find(|i| i.in_region(region) && i.is_type(instance_type))
}

pub(crate) fn local_any<'a>(
    instances: &'a [DatabaseInstance],
    region: &str,
    namespace: &'a str,
) -> Option<&'a DatabaseInstance> {
    owned_by(instances, namespace).find(|i| i.in_region(region))
}

/// The primary serving the other site.
pub(crate) fn remote_primary<'a>(
    instances: &'a [DatabaseInstance],
    region: &str,
    namespace: &'a str,
) -> Option<&'a DatabaseInstance> {
    owned_by(instances, namespace).find(|i| !i.in_region(region) && i.is_type(CLOUD_SQL_INSTANCE))
}

/// Read-replica definition following `primary` into `region`. The replica
/// copies the primary's network settings but never gets a public address.
pub(crate) fn replica_for(
    primary: &DatabaseInstance,
    name: String,
    region: &str,
    namespace: &str,
) -> DatabaseInstance {
    let primary_settings = primary.settings.clone().unwrap_or_default();
    let mut ip_configuration = match primary_settings.ip_configuration {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    ip_configuration["ipv4Enabled"] = Value::Bool(false);

    DatabaseInstance {
        name: Some(name),
        region: Some(region.to_string()),
        instance_type: Some(READ_REPLICA_INSTANCE.to_string()),
        database_version: primary.database_version.clone(),
        master_instance_name: primary.name.clone(),
        settings: Some(Settings {
            user_labels: [(NAMESPACE_LABEL.to_string(), namespace.to_string())]
                .into_iter()
                .collect(),
            tier: primary_settings.tier,
            ip_configuration: Some(ip_configuration),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_conflict(e: &SiteManagerError) -> bool {
    let conflict = matches!(e, SiteManagerError::Provider { status: 409, .. });
    if conflict {
        warn!(error = %e, "Cloud SQL returned 409, retrying");
    }
    conflict
}

/// Transport failures and 5xx/429 answers; the request may succeed later.
fn is_transient(e: &SiteManagerError) -> bool {
    let transient = match e {
        SiteManagerError::Http(_) => true,
        SiteManagerError::Provider { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    };
    if transient {
        warn!(error = %e, "Cloud SQL request failed, retrying");
    }
    transient
}

impl CloudSqlBackend {
    pub fn new(
        settings: CloudSqlSettings,
        provider: Arc<dyn ManagedDbProvider>,
        database: Arc<dyn DatabaseOps>,
        proxy: Arc<dyn ProxyControl>,
        timings: Timings,
    ) -> Self {
        Self {
            settings,
            provider,
            database,
            proxy,
            timings,
        }
    }

    /// Instance listing used by transitions, retried on transient errors.
    async fn list_instances(&self) -> Result<Vec<DatabaseInstance>> {
        let provider = self.provider.as_ref();
        retry_with_timeout(
            self.timings.operation_poll,
            self.timings.provider_retry_timeout,
            move || provider.list_instances(),
            is_transient,
        )
        .await
    }

    /// Submit a mutating call, retrying 409 for `budget`. `None` means the
    /// provider reported the instance as already in the requested shape.
    async fn submit<F, Fut>(
        &self,
        what: &str,
        budget: Duration,
        call: F,
    ) -> Result<Option<Operation>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Operation>>,
    {
        info!(what, "Submitting Cloud SQL request");
        match retry_with_timeout(self.timings.operation_poll, budget, call, is_conflict).await {
            Ok(op) => Ok(Some(op)),
            Err(SiteManagerError::Provider { status: 304, .. }) => {
                warn!(what, "Instance has not been modified, nothing to do");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn wait_for_operation(&self, name: &str) -> Result<()> {
        info!("Waiting for operation to complete");
        let provider = self.provider.as_ref();
        let done = poll_with_timeout(
            self.timings.operation_poll,
            self.timings.operation_timeout,
            move || async move {
                let op = provider.get_operation(name).await?;
                let errors = op.errors();
                if !errors.is_empty() {
                    for e in errors {
                        error!(
                            kind = e.kind.as_deref().unwrap_or_default(),
                            code = e.code.as_deref().unwrap_or_default(),
                            message = e.message.as_deref().unwrap_or_default(),
                            "Cloud SQL operation error"
                        );
                    }
                    let message = errors
                        .iter()
                        .filter_map(|e| e.message.as_deref())
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(SiteManagerError::Operation {
                        operation: name.to_string(),
                        message,
                    });
                }
                info!(status = op.status.as_deref().unwrap_or_default(), "Operation status");
                Ok(op.is_done())
            },
        )
        .await?;
        if !done {
            return Err(SiteManagerError::timeout(
                format!("operation {name}"),
                self.timings.operation_timeout,
            ));
        }
        Ok(())
    }

    async fn submit_and_wait<F, Fut>(&self, what: &str, budget: Duration, call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Operation>>,
    {
        let started = Instant::now();
        if let Some(op) = self.submit(what, budget, call).await? {
            self.wait_for_operation(&op.name).await?;
        }
        info!(what, elapsed_secs = started.elapsed().as_secs(), "Cloud SQL request finished");
        Ok(())
    }

    async fn find_remote_primary(&self) -> Result<DatabaseInstance> {
        let instances = self.list_instances().await?;
        remote_primary(&instances, &self.settings.region, &self.settings.namespace)
            .cloned()
            .ok_or_else(|| SiteManagerError::NotFound {
                kind: "primary instance outside region",
                name: self.settings.region.clone(),
            })
    }

    async fn create_replica(&self, primary: &DatabaseInstance) -> Result<()> {
        let name = format!(
            "{}-{}-{}",
            self.settings.namespace,
            self.settings.region,
            Utc::now().timestamp()
        );
        info!(%name, region = %self.settings.region, "Creating read replica");
        let replica = replica_for(primary, name, &self.settings.region, &self.settings.namespace);
        let provider = self.provider.as_ref();
        let replica = &replica;
        self.submit_and_wait("insert replica", self.timings.provider_retry_timeout, move || {
            provider.insert_instance(replica)
        })
        .await
    }

    async fn to_standby(&self) -> Result<()> {
        let primary = self.find_remote_primary().await?;
        let (region, namespace) = (&self.settings.region, &self.settings.namespace);

        let instances = self.list_instances().await?;
        match local_of_type(&instances, region, namespace, READ_REPLICA_INSTANCE) {
            Some(replica) => {
                info!(replica = replica.name(), "Read replica in current region exists")
            }
            None => {
                info!("Read replica does not exist in current region, creating");
                self.create_replica(&primary).await?;
            }
        }

        let instances = self.list_instances().await?;
        let Some(local_primary) = local_of_type(&instances, region, namespace, CLOUD_SQL_INSTANCE)
        else {
            info!("Primary instance in current region not found, skipping delete");
            return Ok(());
        };
        let name = local_primary.name().to_string();
        info!(instance = %name, "Dropping primary instance in current region");
        let provider = self.provider.as_ref();
        let target = name.as_str();
        // The delete operation is not awaited; the replica already serves the site.
        if let Some(op) = self
            .submit("delete instance", self.timings.provider_retry_timeout, move || {
                provider.delete_instance(target)
            })
            .await?
        {
            info!(operation = %op.name, "Drop instance submitted");
        }
        Ok(())
    }

    async fn to_active(&self) -> Result<()> {
        let (region, namespace) = (&self.settings.region, &self.settings.namespace);
        let instances = self.list_instances().await?;

        let target = match local_of_type(&instances, region, namespace, READ_REPLICA_INSTANCE) {
            Some(replica) => {
                let name = replica.name();
                info!(replica = name, "Promoting read replica");
                let provider = self.provider.as_ref();
                self.submit_and_wait("promote replica", self.timings.operation_timeout, move || {
                    provider.promote_replica(name)
                })
                .await?;

                let ha = DatabaseInstance {
                    settings: Some(Settings {
                        availability_type: Some(REGIONAL_AVAILABILITY.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                let ha = &ha;
                self.submit_and_wait("enable HA", self.timings.provider_retry_timeout, move || {
                    provider.patch_instance(name, ha)
                })
                .await?;

                self.database
                    .terminate_active_connections(&self.settings.proxy_host)
                    .await?;
                replica
            }
            None => {
                info!("No read replica in current region, using the regional instance");
                local_any(&instances, region, namespace).ok_or_else(|| {
                    SiteManagerError::NotFound {
                        kind: "instance in region",
                        name: region.clone(),
                    }
                })?
            }
        };
        let connection = target.connection_name.as_deref().ok_or_else(|| {
            SiteManagerError::Internal(format!("instance {} has no connection name", target.name()))
        })?;
        self.proxy.repoint_proxy(connection).await
    }

    /// Best effort: lag that never drains is logged and the flow goes on.
    async fn wait_until_standby_synced(&self) {
        let database = self.database.as_ref();
        let host = self.settings.proxy_host.as_str();
        let synced = poll_with_timeout(
            self.timings.lag_poll,
            self.timings.lag_timeout,
            move || async move {
                match database.replication_lag(host).await? {
                    Some(lag) if lag != 0 => {
                        warn!(lag, "Standby database is lagging, retrying");
                        Ok(false)
                    }
                    _ => Ok::<_, SiteManagerError>(true),
                }
            },
        )
        .await;
        match synced {
            Ok(true) => info!("No replication lag, proceeding"),
            Ok(false) => warn!("Replication lag did not drain in time, proceeding"),
            Err(e) => warn!(error = %e, "Replication lag check failed, proceeding"),
        }
    }
}

#[async_trait]
impl SiteBackend for CloudSqlBackend {
    fn name(&self) -> &'static str {
        "cloud-sql"
    }

    fn accepts(&self, mode: &Mode) -> bool {
        matches!(mode, Mode::Active | Mode::Standby)
    }

    #[instrument(skip(self), fields(mode = %req.mode))]
    async fn request_mode_change(&self, req: &ModeChangeRequest) -> Result<()> {
        info!("Received mode change, processing");
        match &req.mode {
            Mode::Standby => self.to_standby().await,
            Mode::Active => self.to_active().await,
            other => Err(SiteManagerError::UnsupportedMode(other.to_string())),
        }
    }

    async fn health(&self) -> HealthStatus {
        let instances = match self.provider.list_instances().await {
            Ok(i) => i,
            Err(e) => {
                warn!(error = %e, "Can not list Cloud SQL instances");
                return HealthStatus::Down;
            }
        };
        match local_any(&instances, &self.settings.region, &self.settings.namespace) {
            Some(i) if i.state.as_deref() == Some(STATE_RUNNABLE) => HealthStatus::Up,
            _ => HealthStatus::Down,
        }
    }

    async fn current_mode(&self) -> Result<Option<Mode>> {
        let (region, namespace) = (&self.settings.region, &self.settings.namespace);
        let instances = self.provider.list_instances().await?;
        if let Some(i) = local_of_type(&instances, region, namespace, CLOUD_SQL_INSTANCE) {
            info!(instance = i.name(), %region, "Primary instance found, site is active");
            return Ok(Some(Mode::Active));
        }
        if let Some(i) = local_of_type(&instances, region, namespace, READ_REPLICA_INSTANCE) {
            info!(instance = i.name(), %region, "Read replica found, site is standby");
            return Ok(Some(Mode::Standby));
        }
        Ok(None)
    }

    fn supports_pre_configure(&self) -> bool {
        true
    }

    #[instrument(skip(self), fields(mode = %req.mode, no_wait = req.no_wait))]
    async fn pre_configure(&self, req: &ModeChangeRequest) -> Result<()> {
        match &req.mode {
            Mode::Active => {
                info!("Nothing to prepare for standby to active, waiting");
                sleep(self.timings.active_pre_configure_delay).await;
                Ok(())
            }
            Mode::Standby => {
                if !req.no_wait {
                    self.wait_until_standby_synced().await;
                }
                let primary = self.find_remote_primary().await?;
                self.database
                    .terminate_active_connections(&self.settings.proxy_host)
                    .await?;
                let connection = primary.connection_name.as_deref().ok_or_else(|| {
                    SiteManagerError::Internal(format!(
                        "instance {} has no connection name",
                        primary.name()
                    ))
                })?;
                self.proxy.repoint_proxy(connection).await
            }
            _ => Ok(()),
        }
    }
}
