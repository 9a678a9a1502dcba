use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kube::{Api, Client};
use tracing::{info, warn};

use crate::{
    backend::{
        BackendKind, CloudSqlBackend, CloudSqlDiscovery, CloudSqlSettings, PatroniBackend,
        SiteBackend,
    },
    clients::{PatroniClient, PgClient},
    cloudsql::{ServiceAccountKey, ServiceAccountTokenSource, SqlAdminClient},
    config::{ClusterSettings, SiteManagerConfig, Timings},
    crd::PatroniServices,
    k8s::{CrStatusStore, KubeOps, read_cloud_sql_discovery},
    sitemanager::{FileStatusStore, ModeController, StatusStore, TransitionKind, sync_on_startup},
    web::{AppState, AuthGate, KubeTokenReviewer, build_router, run_http_server},
};

const STARTUP_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &SiteManagerConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Cluster name declared on `PatroniServices`, else the configured one.
async fn resolve_cluster_name(client: Client, cfg: &SiteManagerConfig) -> String {
    let api: Api<PatroniServices> = Api::namespaced(client, &cfg.namespace);
    match api.get_opt(&cfg.services_cr_name).await {
        Ok(Some(cr)) => cr
            .cluster_name()
            .map(str::to_string)
            .unwrap_or_else(|| cfg.cluster_name.clone()),
        Ok(None) => {
            warn!(
                name = %cfg.services_cr_name,
                "PatroniServices not found, using configured cluster name"
            );
            cfg.cluster_name.clone()
        }
        Err(e) => {
            warn!(error = %e, "Can not read PatroniServices, using configured cluster name");
            cfg.cluster_name.clone()
        }
    }
}

fn cloud_sql_backend(
    client: Client,
    cfg: &SiteManagerConfig,
    cluster: ClusterSettings,
    discovery: CloudSqlDiscovery,
    timings: Timings,
) -> anyhow::Result<Arc<dyn SiteBackend>> {
    let key = ServiceAccountKey::from_json(&discovery.credentials)
        .context("parse Cloud SQL service-account key")?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let tokens = Arc::new(ServiceAccountTokenSource::new(http, key)?);
    let provider = Arc::new(SqlAdminClient::new(
        cfg.cloud_sql.api_url.as_str(),
        discovery.project.as_str(),
        tokens,
    )?);
    let proxy = Arc::new(
        KubeOps::new(
            client,
            cluster,
            cfg.services_cr_name.as_str(),
            cfg.core_cr_name.as_str(),
            timings.clone(),
        )
        .with_proxy_daemonset(cfg.cloud_sql.proxy_daemonset.as_str()),
    );
    let settings = CloudSqlSettings {
        region: discovery.region,
        namespace: cfg.namespace.clone(),
        proxy_host: cfg.cloud_sql.proxy_host.clone(),
    };
    info!(project = %discovery.project, region = %settings.region, "Using Cloud SQL backend");
    Ok(Arc::new(CloudSqlBackend::new(
        settings,
        provider,
        Arc::new(PgClient::new(cfg.postgres.clone())),
        proxy,
        timings,
    )))
}

fn patroni_backend(
    client: Client,
    cfg: &SiteManagerConfig,
    cluster: ClusterSettings,
    timings: Timings,
) -> anyhow::Result<Arc<dyn SiteBackend>> {
    let coordination = Arc::new(PatroniClient::new(cluster.patroni_url.as_str())?);
    let workloads = Arc::new(KubeOps::new(
        client,
        cluster.clone(),
        cfg.services_cr_name.as_str(),
        cfg.core_cr_name.as_str(),
        timings.clone(),
    ));
    info!(cluster = %cluster.cluster_name, "Using Patroni backend");
    Ok(Arc::new(PatroniBackend::new(
        cluster,
        coordination,
        Arc::new(PgClient::new(cfg.postgres.clone())),
        workloads,
        timings,
    )))
}

fn auth_gate(client: Client, cfg: &SiteManagerConfig) -> Option<Arc<AuthGate>> {
    if !cfg.auth.enabled {
        return None;
    }
    let reviewer = Arc::new(KubeTokenReviewer::new(client, cfg.auth.custom_audience.clone()));
    info!(user = %cfg.auth.expected_user(), "HTTP authentication enabled");
    Some(Arc::new(AuthGate::new(
        reviewer,
        cfg.auth.expected_user(),
        Duration::from_secs(cfg.auth.session_timeout_mins * 60),
    )))
}

/// Select the backend, reconcile the status records and serve HTTP until
/// shutdown.
pub async fn run_all(client: Client, cfg: SiteManagerConfig) -> anyhow::Result<()> {
    let timings = Timings::from(&cfg.timings);
    let cluster_name = resolve_cluster_name(client.clone(), &cfg).await;
    let cluster = ClusterSettings::new(&cluster_name, &cfg.namespace);

    let backend = match read_cloud_sql_discovery(client.clone(), &cfg.namespace, &cfg.cloud_sql)
        .await
        .context("inspect Cloud SQL configuration")?
    {
        BackendKind::ManagedCloud(discovery) => {
            cloud_sql_backend(client.clone(), &cfg, cluster, discovery, timings.clone())?
        }
        BackendKind::SelfManaged => {
            patroni_backend(client.clone(), &cfg, cluster, timings.clone())?
        }
    };

    let site_store: Arc<dyn StatusStore> = Arc::new(
        CrStatusStore::new(client.clone(), &cfg.namespace, cfg.services_cr_name.as_str())
            .with_retry(timings.status_update_interval, timings.status_update_timeout),
    );
    let site = ModeController::new(TransitionKind::ModeChange, site_store, backend.clone())
        .with_retry(timings.status_update_interval, timings.status_update_timeout);
    let pre_configure = backend.supports_pre_configure().then(|| {
        let store: Arc<dyn StatusStore> = Arc::new(FileStatusStore::new(
            cfg.cloud_sql.pre_configure_status_path.as_str(),
        ));
        ModeController::new(TransitionKind::PreConfigure, store, backend.clone())
            .with_retry(timings.status_update_interval, timings.status_update_timeout)
    });

    sync_on_startup(
        &site,
        pre_configure.as_ref(),
        backend.as_ref(),
        timings.startup_sync_attempts,
        STARTUP_SYNC_INTERVAL,
    )
    .await
    .context("resolve interrupted transitions before serving")?;

    let state = AppState {
        site,
        pre_configure,
        backend,
    };
    let app = build_router(state, auth_gate(client, &cfg));
    run_http_server(compute_http_addr(&cfg), app).await
}
