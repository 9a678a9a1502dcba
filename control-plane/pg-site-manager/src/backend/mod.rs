//! Strategies that carry out a mode transition on a concrete database
//! deployment.

mod cloud_sql;
mod patroni;
mod select;

pub use cloud_sql::{CloudSqlBackend, CloudSqlSettings};
pub use patroni::PatroniBackend;
pub use select::{BackendKind, CloudSqlDiscovery, choose_backend};

use async_trait::async_trait;

use crate::error::{Result, SiteManagerError};
use crate::sitemanager::{HealthStatus, Mode, ModeChangeRequest};

#[async_trait]
pub trait SiteBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `mode` can be requested through `/sitemanager` at all.
    fn accepts(&self, mode: &Mode) -> bool {
        mode.is_supported()
    }

    /// Drive the site into `req.mode`. Runs detached from the HTTP request.
    async fn request_mode_change(&self, req: &ModeChangeRequest) -> Result<()>;

    async fn health(&self) -> HealthStatus;

    /// Mode observed on the live deployment, used to seed the status record
    /// at startup. `None` means the backend has no opinion.
    async fn current_mode(&self) -> Result<Option<Mode>> {
        Ok(None)
    }

    fn supports_pre_configure(&self) -> bool {
        false
    }

    async fn pre_configure(&self, _req: &ModeChangeRequest) -> Result<()> {
        Err(SiteManagerError::PreConfigureUnsupported(self.name()))
    }

    /// Undo any side effect a rejected request may have left behind.
    async fn reject_unsupported(&self, _requested: &Mode, _current: Option<&Mode>) {}
}
