use envconfig::Envconfig;
use kube::Client;
use pg_site_manager::{config::SiteManagerConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    // kube and reqwest both ride on rustls; pin the provider once up front.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = SiteManagerConfig::init_from_env()?;
    info!(?cfg, "Starting Site Manager");

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}
