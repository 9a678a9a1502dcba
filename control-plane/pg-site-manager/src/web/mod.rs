//! HTTP control surface consumed by the external site-manager orchestrator.

mod auth;
mod handlers;

pub use auth::{AuthGate, KubeTokenReviewer, TokenReviewer, require_token};
pub use handlers::ApiError;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::backend::SiteBackend;
use crate::sitemanager::ModeController;

#[derive(Clone)]
pub struct AppState {
    pub site: ModeController,
    /// Present only when the backend has a pre-configure step.
    pub pre_configure: Option<ModeController>,
    pub backend: Arc<dyn SiteBackend>,
}

pub fn build_router(state: AppState, auth: Option<Arc<AuthGate>>) -> Router {
    let mut router = Router::new()
        .route(
            "/sitemanager",
            get(handlers::get_site_manager).post(handlers::post_site_manager),
        )
        .route("/health", get(handlers::health))
        .route(
            "/pre-configure",
            get(handlers::get_pre_configure).post(handlers::post_pre_configure),
        )
        .with_state(state);

    if let Some(gate) = auth {
        router = router.layer(middleware::from_fn_with_state(gate, require_token));
    }
    router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn run_http_server(addr: SocketAddr, app: Router) -> anyhow::Result<()> {
    info!("Site Manager HTTP listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Site Manager HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Can not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Can not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
