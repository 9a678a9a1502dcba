use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use super::SiteBackend;
use crate::clients::{
    CoordinationApi, DatabaseOps, clear_standby_cluster_patch, standby_cluster_patch,
};
use crate::config::{ClusterSettings, HealthCheckLimits, Timings};
use crate::crd::StandbyCluster;
use crate::error::{Result, SiteManagerError};
use crate::health::HealthEvaluator;
use crate::k8s::PatroniWorkloads;
use crate::poll::poll_with_timeout;
use crate::sitemanager::{HealthStatus, Mode, ModeChangeRequest};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_PG_PORT: u16 = 5432;

/// Self-managed strategy: drives Patroni and the node statefulsets directly.
pub struct PatroniBackend {
    cluster: ClusterSettings,
    coordination: Arc<dyn CoordinationApi>,
    database: Arc<dyn DatabaseOps>,
    workloads: Arc<dyn PatroniWorkloads>,
    evaluator: HealthEvaluator,
    timings: Timings,
}

impl PatroniBackend {
    pub fn new(
        cluster: ClusterSettings,
        coordination: Arc<dyn CoordinationApi>,
        database: Arc<dyn DatabaseOps>,
        workloads: Arc<dyn PatroniWorkloads>,
        timings: Timings,
    ) -> Self {
        let evaluator =
            HealthEvaluator::new(coordination.clone(), database.clone(), cluster.pg_host.clone());
        Self {
            cluster,
            coordination,
            database,
            workloads,
            evaluator,
            timings,
        }
    }

    async fn is_up(&self) -> bool {
        match self.workloads.expected_members().await {
            Ok(expected) => self.evaluator.is_up(expected).await,
            Err(e) => {
                warn!(error = %e, "Can not read expected member count");
                false
            }
        }
    }

    /// Health within `timeout`, probing immediately and then periodically.
    async fn await_healthy(&self, timeout: Duration) -> bool {
        poll_with_timeout(HEALTH_CHECK_INTERVAL, timeout, move || async move {
            Ok::<_, Infallible>(self.is_up().await)
        })
        .await
        .unwrap_or(false)
    }

    async fn health_limits(&self) -> HealthCheckLimits {
        let fallback = self.timings.health;
        match self.workloads.site_manager_spec().await {
            Ok(spec) => match spec.standby_cluster_health_check {
                Some(hc) => fallback.overridden_by(
                    hc.retries_limit,
                    hc.failure_retries_limit,
                    hc.retries_wait_timeout,
                ),
                None => fallback,
            },
            Err(e) => {
                warn!(error = %e, "Can not read health check limits, using defaults");
                fallback
            }
        }
    }

    /// `retries_limit` consecutive healthy checks succeed; the
    /// `failure_retries_limit`-th unhealthy check gives up.
    async fn wait_for_cluster_healthy(&self, limits: HealthCheckLimits) -> bool {
        info!(
            retries = limits.retries_limit,
            wait_secs = limits.wait.as_secs(),
            "Waiting for consecutive successful health checks"
        );
        let mut successes = 0;
        let mut failures = 0;
        loop {
            if successes >= limits.retries_limit {
                info!("Patroni cluster is healthy");
                return true;
            }
            if failures >= limits.failure_retries_limit {
                warn!("Patroni cluster is not healthy, no retry left");
                return false;
            }
            sleep(limits.wait).await;
            if self.is_up().await {
                successes += 1;
            } else {
                successes = 0;
                failures += 1;
            }
        }
    }

    async fn active_source(&self) -> Result<StandbyCluster> {
        let spec = self.workloads.site_manager_spec().await?;
        let host = spec
            .active_cluster_host
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                SiteManagerError::Internal("siteManager.activeClusterHost is not set".into())
            })?;
        Ok(StandbyCluster {
            host,
            port: spec.active_cluster_port.unwrap_or(DEFAULT_PG_PORT),
        })
    }

    async fn to_standby(&self) -> Result<()> {
        let source = self.active_source().await?;
        let limits = self.health_limits().await;
        let mut healthy = self.await_healthy(self.timings.standby_health_timeout).await;
        let attempts = self.timings.standby_max_attempts;

        for attempt in 1..=attempts {
            info!(attempt, healthy, "Processing standby mode");
            match self.standby_attempt(healthy, &source, limits).await {
                Ok(true) => {
                    self.workloads.remove_cleaner_init().await?;
                    info!("Patroni cluster is healthy after switching to standby");
                    return Ok(());
                }
                Ok(false) => warn!(attempt, "Standby cluster is not healthy after attempt"),
                Err(e @ SiteManagerError::ReconcileFailed) => return Err(e),
                Err(e) => warn!(attempt, error = %e, "Standby attempt failed"),
            }
            healthy = false;
        }
        Err(SiteManagerError::Unhealthy(format!(
            "standby cluster did not become healthy in {attempts} attempts"
        )))
    }

    async fn standby_attempt(
        &self,
        healthy: bool,
        source: &StandbyCluster,
        limits: HealthCheckLimits,
    ) -> Result<bool> {
        if healthy {
            match self
                .database
                .terminate_active_connections(&self.cluster.pg_host)
                .await
            {
                Ok(()) => {}
                Err(e @ SiteManagerError::DatabaseUnavailable { .. }) => {
                    warn!(error = %e, "Database unreachable, skipping connection termination");
                }
                Err(e) => return Err(e),
            }
        } else {
            info!("Patroni cluster is not healthy before standby switch, re-seeding members");
            let patch =
                standby_cluster_patch(&source.host, source.port, &self.cluster.cluster_name);
            self.coordination.patch_config(&patch).await?;
            self.workloads.reinit_members().await?;
        }
        self.workloads.set_standby_source(Some(source)).await?;
        self.workloads.wait_until_reconcile_done().await?;
        Ok(self.wait_for_cluster_healthy(limits).await)
    }

    async fn to_active(&self) -> Result<()> {
        self.workloads.set_standby_source(None).await?;
        self.workloads.wait_until_reconcile_done().await?;
        self.coordination
            .patch_config(&clear_standby_cluster_patch())
            .await?;
        self.workloads.scale_members(1).await?;
        let limits = self.health_limits().await;
        if !self.wait_for_cluster_healthy(limits).await {
            return Err(SiteManagerError::Unhealthy(
                "cluster did not become healthy after switching to active".into(),
            ));
        }
        info!("Patroni cluster is healthy after switching to active");
        Ok(())
    }

    /// Where the external alias should resolve for `mode`.
    async fn external_target(&self, mode: &Mode) -> Result<Option<String>> {
        match mode {
            Mode::Standby => Ok(Some(self.active_source().await?.host)),
            Mode::Active => Ok(Some(self.cluster.pg_host.clone())),
            _ => Ok(None),
        }
    }

    async fn update_external_service(&self, mode: &Mode) {
        let target = match self.external_target(mode).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Can not resolve external service target");
                return;
            }
        };
        if let Err(e) = self.workloads.point_external_service(&target).await {
            warn!(error = %e, %target, "Can not update external service");
        }
    }
}

#[async_trait]
impl SiteBackend for PatroniBackend {
    fn name(&self) -> &'static str {
        "patroni"
    }

    #[instrument(skip(self), fields(mode = %req.mode))]
    async fn request_mode_change(&self, req: &ModeChangeRequest) -> Result<()> {
        info!("Received mode change, processing");
        self.workloads.wait_until_reconcile_done().await?;
        match &req.mode {
            Mode::Standby => self.to_standby().await?,
            Mode::Active => self.to_active().await?,
            Mode::Disabled => self.workloads.scale_members(0).await?,
            Mode::Unsupported(raw) => {
                error!("mode {raw} not supported");
                return Err(SiteManagerError::UnsupportedMode(raw.clone()));
            }
        }
        self.update_external_service(&req.mode).await;
        Ok(())
    }

    async fn health(&self) -> HealthStatus {
        match self.workloads.expected_members().await {
            Ok(expected) => self.evaluator.assess(expected).await.status(),
            Err(e) => {
                warn!(error = %e, "Can not read expected member count");
                HealthStatus::Down
            }
        }
    }

    async fn reject_unsupported(&self, requested: &Mode, current: Option<&Mode>) {
        info!(%requested, "Reverting external service after rejected mode");
        if let Some(mode) = current {
            self.update_external_service(mode).await;
        }
    }
}
