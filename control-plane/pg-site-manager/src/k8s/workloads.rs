use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, StatefulSet},
        core::v1::{
            ConfigMap, Container, EnvVar, Pod, ResourceRequirements, Service,
            VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde_json::json;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use super::is_not_found;
use crate::config::{ClusterSettings, Timings};
use crate::crd::{PatroniCore, PatroniServices, ReconcilePhase, SiteManagerSpec, StandbyCluster};
use crate::error::{Result, SiteManagerError};
use crate::poll::{poll_with_timeout, retry_with_timeout};

pub const CLEANER_CONTAINER: &str = "pg-cleaner";
const DATA_DIR: &str = "/var/lib/pgsql/data";
const PROXY_INSTANCES_ENV: &str = "INSTANCES";

/// Cluster resources the self-managed backend manipulates.
#[async_trait]
pub trait PatroniWorkloads: Send + Sync {
    async fn site_manager_spec(&self) -> Result<SiteManagerSpec>;

    /// Desired member count from `PatroniCore`.
    async fn expected_members(&self) -> Result<usize>;

    /// Write or clear `spec.patroni.standbyCluster` on `PatroniCore`.
    async fn set_standby_source(&self, source: Option<&StandbyCluster>) -> Result<()>;

    /// Block until the operator's reconcile cycle is idle. A failed cycle is
    /// an error.
    async fn wait_until_reconcile_done(&self) -> Result<()>;

    async fn scale_members(&self, replicas: i32) -> Result<()>;

    /// Re-seed every member from scratch: stop, wipe data, start one node.
    async fn reinit_members(&self) -> Result<()>;

    async fn remove_cleaner_init(&self) -> Result<()>;

    /// Point the external alias service at `external_name`.
    async fn point_external_service(&self, external_name: &str) -> Result<()>;
}

/// Connection proxy in front of a managed database.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Route the proxy at `connection_name` and restart its pods.
    async fn repoint_proxy(&self, connection_name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct KubeOps {
    client: Client,
    cluster: ClusterSettings,
    services_cr: String,
    core_cr: String,
    proxy_daemonset: String,
    proxy_selector: String,
    timings: Timings,
}

impl KubeOps {
    pub fn new(
        client: Client,
        cluster: ClusterSettings,
        services_cr: impl Into<String>,
        core_cr: impl Into<String>,
        timings: Timings,
    ) -> Self {
        Self {
            client,
            cluster,
            services_cr: services_cr.into(),
            core_cr: core_cr.into(),
            proxy_daemonset: "cloudsql-proxy".into(),
            proxy_selector: "app=cloudsql-proxy".into(),
            timings,
        }
    }

    pub fn with_proxy_daemonset(mut self, name: impl Into<String>) -> Self {
        self.proxy_daemonset = name.into();
        self
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.cluster.namespace)
    }

    async fn node_statefulsets(&self) -> Result<Vec<StatefulSet>> {
        let sts: Api<StatefulSet> = self.api();
        let list = sts.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|s| s.name_any().starts_with(&self.cluster.statefulset_prefix))
            .collect())
    }

    /// Apply `mutate` to every node statefulset and write back the ones it
    /// changed, retrying on update conflicts.
    async fn update_statefulsets<F>(&self, what: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut StatefulSet) -> bool + Send + Sync,
    {
        let api: Api<StatefulSet> = self.api();
        retry_with_timeout(
            self.timings.status_update_interval,
            self.timings.status_update_timeout,
            || async {
                for mut sts in self.node_statefulsets().await? {
                    if !mutate(&mut sts) {
                        continue;
                    }
                    let name = sts.name_any();
                    info!(statefulset = %name, "{what}");
                    api.replace(&name, &PostParams::default(), &sts).await?;
                }
                Ok(())
            },
            |e: &SiteManagerError| e.is_conflict(),
        )
        .await
    }

    async fn wait_member_pods_deleted(&self) -> Result<()> {
        let pods: Api<Pod> = self.api();
        let selector = self.cluster.label_selector();
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        for pod in list.items {
            let name = pod.name_any();
            info!(pod = %name, "Waiting for pod deletion");
            let gone = poll_with_timeout(
                self.timings.pod_delete_interval,
                self.timings.pod_delete_timeout,
                || async { Ok::<_, SiteManagerError>(pods.get_opt(&name).await?.is_none()) },
            )
            .await?;
            if !gone {
                return Err(SiteManagerError::timeout(
                    format!("deletion of pod {name}"),
                    self.timings.pod_delete_timeout,
                ));
            }
        }
        Ok(())
    }

    async fn drop_initialize_annotation(&self) -> Result<()> {
        let cms: Api<ConfigMap> = self.api();
        let patch = json!({
            "metadata": { "annotations": { "initialize": null } }
        });
        match cms
            .patch(&self.cluster.config_map, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                warn!(
                    configmap = %self.cluster.config_map,
                    "Config map not found, nothing to clean"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_core(&self) -> Result<PatroniCore> {
        let api: Api<PatroniCore> = self.api();
        api.get(&self.core_cr).await.map_err(|e| {
            if is_not_found(&e) {
                SiteManagerError::NotFound {
                    kind: "PatroniCore",
                    name: self.core_cr.clone(),
                }
            } else {
                e.into()
            }
        })
    }
}

/// Init container wiping the data volume so the member re-seeds.
pub fn cleaner_init_container(image: Option<String>) -> Container {
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity("50m".into())),
        ("memory".to_string(), Quantity("50Mi".into())),
    ]);
    Container {
        name: CLEANER_CONTAINER.into(),
        image,
        command: Some(vec![
            "bash".into(),
            "-c".into(),
            format!("rm -rf {DATA_DIR}/* && ls -la {DATA_DIR}/"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "data".into(),
            mount_path: DATA_DIR.into(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(limits.clone()),
            limits: Some(limits),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Prepend the cleaner when the template has no init containers yet and
/// scale to one replica. Returns whether anything changed.
pub fn inject_cleaner(sts: &mut StatefulSet) -> bool {
    let Some(spec) = sts.spec.as_mut() else {
        return false;
    };
    spec.replicas = Some(1);
    if let Some(pod) = spec.template.spec.as_mut() {
        let image = pod.containers.first().and_then(|c| c.image.clone());
        let inits = pod.init_containers.get_or_insert_with(Vec::new);
        if inits.is_empty() {
            inits.push(cleaner_init_container(image));
        }
    }
    true
}

/// Returns whether a cleaner container was removed.
pub fn strip_cleaner(sts: &mut StatefulSet) -> bool {
    let Some(inits) = sts
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.init_containers.as_mut())
    else {
        return false;
    };
    let before = inits.len();
    inits.retain(|c| c.name != CLEANER_CONTAINER);
    inits.len() != before
}

/// Point the proxy's `INSTANCES` variable at `connection_name`. Returns
/// whether the variable was present.
pub fn set_proxy_instances(ds: &mut DaemonSet, connection_name: &str) -> bool {
    let Some(container) = ds
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.first_mut())
    else {
        return false;
    };
    let value = format!("{connection_name}=tcp:0.0.0.0:5432");
    let mut found = false;
    for env in container.env.iter_mut().flatten() {
        if env.name == PROXY_INSTANCES_ENV {
            *env = EnvVar {
                name: PROXY_INSTANCES_ENV.into(),
                value: Some(value.clone()),
                value_from: None,
            };
            found = true;
        }
    }
    found
}

#[async_trait]
impl PatroniWorkloads for KubeOps {
    async fn site_manager_spec(&self) -> Result<SiteManagerSpec> {
        let api: Api<PatroniServices> = self.api();
        let cr = api.get(&self.services_cr).await?;
        Ok(cr.spec.site_manager.unwrap_or_default())
    }

    async fn expected_members(&self) -> Result<usize> {
        Ok(self.get_core().await?.expected_members())
    }

    #[instrument(skip(self))]
    async fn set_standby_source(&self, source: Option<&StandbyCluster>) -> Result<()> {
        let api: Api<PatroniCore> = self.api();
        retry_with_timeout(
            self.timings.status_update_interval,
            Duration::from_secs(180),
            || async {
                let core = self.get_core().await?;
                let patch = json!({
                    "metadata": { "resourceVersion": core.resource_version() },
                    "spec": { "patroni": { "standbyCluster": source } },
                });
                api.patch(&self.core_cr, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            },
            |e: &SiteManagerError| {
                let retry = e.is_conflict();
                if retry {
                    warn!("PatroniCore changed concurrently, retrying standby update");
                }
                retry
            },
        )
        .await
    }

    async fn wait_until_reconcile_done(&self) -> Result<()> {
        sleep(self.timings.reconcile_initial_delay).await;
        let done = poll_with_timeout(
            self.timings.reconcile_poll,
            self.timings.reconcile_timeout,
            || async {
                match self.get_core().await?.reconcile_phase() {
                    ReconcilePhase::InProgress => {
                        info!("Reconcile is not done yet, waiting");
                        Ok(false)
                    }
                    ReconcilePhase::Failed => Err(SiteManagerError::ReconcileFailed),
                    ReconcilePhase::Idle => Ok(true),
                }
            },
        )
        .await?;
        if done {
            Ok(())
        } else {
            Err(SiteManagerError::timeout(
                "reconcile to finish",
                self.timings.reconcile_timeout,
            ))
        }
    }

    async fn scale_members(&self, replicas: i32) -> Result<()> {
        self.update_statefulsets("Scaling Patroni statefulset", |sts| {
            let Some(spec) = sts.spec.as_mut() else {
                return false;
            };
            if spec.replicas == Some(replicas) {
                return false;
            }
            spec.replicas = Some(replicas);
            true
        })
        .await
    }

    #[instrument(skip(self))]
    async fn reinit_members(&self) -> Result<()> {
        self.scale_members(0).await?;
        self.wait_member_pods_deleted().await?;
        self.drop_initialize_annotation().await?;
        self.update_statefulsets("Adding cleaner init container", inject_cleaner)
            .await
    }

    async fn remove_cleaner_init(&self) -> Result<()> {
        self.update_statefulsets("Removing cleaner init container", strip_cleaner)
            .await
    }

    async fn point_external_service(&self, external_name: &str) -> Result<()> {
        let svcs: Api<Service> = self.api();
        info!(
            service = %self.cluster.external_service,
            %external_name,
            "Updating external service"
        );
        let patch = json!({ "spec": { "externalName": external_name } });
        svcs.patch(
            &self.cluster.external_service,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyControl for KubeOps {
    async fn repoint_proxy(&self, connection_name: &str) -> Result<()> {
        info!(%connection_name, "Reconfiguring Cloud SQL proxy");
        let dss: Api<DaemonSet> = self.api();
        retry_with_timeout(
            self.timings.status_update_interval,
            self.timings.status_update_timeout,
            || async {
                let mut ds = dss.get(&self.proxy_daemonset).await?;
                if !set_proxy_instances(&mut ds, connection_name) {
                    warn!(daemonset = %self.proxy_daemonset, "Proxy has no INSTANCES variable");
                }
                dss.replace(&self.proxy_daemonset, &PostParams::default(), &ds)
                    .await?;
                Ok(())
            },
            |e: &SiteManagerError| e.is_conflict(),
        )
        .await?;

        let pods: Api<Pod> = self.api();
        pods.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&self.proxy_selector),
        )
        .await?;
        Ok(())
    }
}
