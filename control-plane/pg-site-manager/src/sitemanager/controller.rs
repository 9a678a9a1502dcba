use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use super::store::StatusStore;
use super::types::{Mode, ModeChangeRequest, SiteManagerStatus, TransitionStatus};
use crate::backend::SiteBackend;
use crate::error::{Result, SiteManagerError};
use crate::poll::retry_with_timeout;

/// Which backend capability a controller drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionKind {
    ModeChange,
    PreConfigure,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionKind::ModeChange => "mode change",
            TransitionKind::PreConfigure => "pre-configure",
        })
    }
}

/// Owns one status record and the transitions that move it.
///
/// The record only moves `done|failed -> running -> done|failed`; the
/// `running` check under `gate` keeps at most one transition in flight.
/// Reads and writes that close a transition are retried for `retry_timeout`.
#[derive(Clone)]
pub struct ModeController {
    kind: TransitionKind,
    store: Arc<dyn StatusStore>,
    backend: Arc<dyn SiteBackend>,
    gate: Arc<Mutex<()>>,
    retry_interval: Duration,
    retry_timeout: Duration,
}

impl ModeController {
    pub fn new(
        kind: TransitionKind,
        store: Arc<dyn StatusStore>,
        backend: Arc<dyn SiteBackend>,
    ) -> Self {
        Self {
            kind,
            store,
            backend,
            gate: Arc::new(Mutex::new(())),
            retry_interval: Duration::from_secs(1),
            retry_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_retry(mut self, interval: Duration, timeout: Duration) -> Self {
        self.retry_interval = interval;
        self.retry_timeout = timeout;
        self
    }

    async fn load_retrying(&self) -> Result<SiteManagerStatus> {
        let store = &self.store;
        retry_with_timeout(
            self.retry_interval,
            self.retry_timeout,
            move || async move { store.load().await },
            |e: &SiteManagerError| {
                warn!(error = %e, "Can not read site manager status, retrying");
                true
            },
        )
        .await
    }

    async fn save_retrying(&self, status: &SiteManagerStatus) -> Result<()> {
        let store = &self.store;
        retry_with_timeout(
            self.retry_interval,
            self.retry_timeout,
            move || async move { store.save(status).await },
            |e: &SiteManagerError| {
                warn!(error = %e, "Can not write site manager status, retrying");
                true
            },
        )
        .await
    }

    pub async fn current(&self) -> Result<SiteManagerStatus> {
        self.store.load().await
    }

    /// Rewrite a `running` record left by a previous process to `failed`.
    /// Returns whether such a record was found.
    pub async fn recover(&self) -> Result<bool> {
        let _guard = self.gate.lock().await;
        let mut status = self.load_retrying().await?;
        if !status.is_running() {
            return Ok(false);
        }
        warn!(
            kind = %self.kind,
            mode = ?status.mode,
            "Found transition interrupted by restart, marking failed"
        );
        status.status = Some(TransitionStatus::Failed);
        self.save_retrying(&status).await?;
        Ok(true)
    }

    /// Store `{mode, done}` as observed on the live deployment.
    pub async fn record_observed(&self, mode: Mode) -> Result<()> {
        let _guard = self.gate.lock().await;
        self.store
            .save(&SiteManagerStatus::new(mode, TransitionStatus::Done))
            .await
    }

    /// Accept a transition request. Returns the record the caller should see;
    /// the transition itself continues on a spawned task.
    #[instrument(skip(self), fields(kind = %self.kind, mode = %req.mode))]
    pub async fn handle_request(
        &self,
        req: ModeChangeRequest,
    ) -> Result<SiteManagerStatus> {
        let guard = self.gate.lock().await;
        let current = self.store.load().await?;

        if current.is_running() {
            info!("Received request during running procedure, returning current state");
            return Ok(current);
        }

        if !self.accepts(&req.mode) {
            error!("mode {} not supported", req.mode);
            if self.kind == TransitionKind::ModeChange {
                self.backend
                    .reject_unsupported(&req.mode, current.mode.as_ref())
                    .await;
            }
            return Err(SiteManagerError::UnsupportedMode(req.mode.to_string()));
        }

        if current.is_done_in(&req.mode) {
            info!("Desired mode equals current mode, returning current state");
            return Ok(current);
        }

        let running = SiteManagerStatus {
            mode: Some(req.mode.clone()),
            status: Some(TransitionStatus::Running),
            no_wait: req.no_wait,
        };
        self.store.save(&running).await?;
        drop(guard);

        let this = self.clone();
        tokio::spawn(async move { this.run_transition(req).await });
        Ok(running)
    }

    fn accepts(&self, mode: &Mode) -> bool {
        match self.kind {
            TransitionKind::ModeChange => self.backend.accepts(mode),
            TransitionKind::PreConfigure => mode.is_supported(),
        }
    }

    async fn run_transition(self, req: ModeChangeRequest) {
        info!(
            kind = %self.kind,
            mode = %req.mode,
            backend = self.backend.name(),
            "Starting transition"
        );
        let outcome = match self.kind {
            TransitionKind::ModeChange => self.backend.request_mode_change(&req).await,
            TransitionKind::PreConfigure => self.backend.pre_configure(&req).await,
        };

        let _guard = self.gate.lock().await;
        let running = SiteManagerStatus {
            mode: Some(req.mode.clone()),
            status: Some(TransitionStatus::Running),
            no_wait: req.no_wait,
        };
        let outcome = match outcome {
            Ok(()) => {
                let stored = self.load_retrying().await.unwrap_or_else(|e| {
                    warn!(error = %e, "Can not re-read status after transition");
                    running.clone()
                });
                if stored.mode.as_ref() != Some(&req.mode)
                    || stored.status == Some(TransitionStatus::Done)
                {
                    return;
                }
                SiteManagerStatus {
                    status: Some(TransitionStatus::Done),
                    ..stored
                }
            }
            Err(e) => {
                error!(
                    kind = %self.kind,
                    mode = %req.mode,
                    error = %e,
                    "Failed to change mode"
                );
                SiteManagerStatus {
                    status: Some(TransitionStatus::Failed),
                    ..running
                }
            }
        };

        match self.save_retrying(&outcome).await {
            Ok(()) if outcome.status == Some(TransitionStatus::Done) => {
                info!(kind = %self.kind, mode = %req.mode, "Successfully changed mode");
            }
            Ok(()) => {}
            Err(e) if outcome.status == Some(TransitionStatus::Done) => {
                error!(error = %e, "Can not record finished transition, marking failed");
                let failed = SiteManagerStatus {
                    status: Some(TransitionStatus::Failed),
                    ..outcome
                };
                if let Err(e) = self.save_retrying(&failed).await {
                    error!(error = %e, "Failed to update site manager status");
                }
            }
            Err(e) => error!(error = %e, "Failed to update site manager status"),
        }
    }
}

/// Bring both records in line with the deployment before serving.
///
/// Interrupted transitions become `failed`; an error here means a record
/// may still read `running` and the caller must not serve. Only when nothing
/// was running is the backend's observed mode written as `done` into each
/// record, best-effort.
pub async fn sync_on_startup(
    main: &ModeController,
    pre_configure: Option<&ModeController>,
    backend: &dyn SiteBackend,
    attempts: u32,
    retry_interval: Duration,
) -> Result<()> {
    let mut interrupted = main.recover().await?;
    if let Some(pre) = pre_configure {
        interrupted |= pre.recover().await?;
    }
    if interrupted {
        return Ok(());
    }

    let mut attempt = 0;
    let observed = loop {
        attempt += 1;
        match backend.current_mode().await {
            Ok(mode) => break mode,
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %e, "Can not read current mode, retrying");
                tokio::time::sleep(retry_interval).await;
            }
            Err(e) => {
                error!(error = %e, "Can not read current mode, skipping status sync");
                return Ok(());
            }
        }
    };

    let Some(mode) = observed else {
        return Ok(());
    };
    info!(%mode, backend = backend.name(), "Setting status from live deployment");
    for ctrl in std::iter::once(main).chain(pre_configure) {
        if let Err(e) = ctrl.record_observed(mode.clone()).await {
            warn!(kind = %ctrl.kind, error = %e, "Not able to record observed mode");
        }
    }
    Ok(())
}
