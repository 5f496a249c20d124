//! Zentinel MDM server binary.
//!
//! Run with: `zentinel-mdm --config config.yaml`
//!
//! TLS is expected to terminate upstream; the server listens on plain HTTP and
//! reads the device certificate from the forwarding header.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_mdm::service::TokenVerifier;
use zentinel_mdm::{
    router, AppState, CertificateAuthority, Collaborators, FederatedKeyCache,
    FederatedTokenVerifier, MdmConfig,
};

/// Windows MDM enrollment and management server.
///
/// Serves the discovery, enrollment policy, enrollment and OMA-DM management
/// endpoints a Windows device uses to join and be managed.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, overriding the configured one (e.g. "0.0.0.0:8000")
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel MDM v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    // Load configuration
    let mut config: MdmConfig = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        serde_yaml::from_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        MdmConfig::default()
    };
    if let Some(listen) = args.listen {
        config.settings.listen_address = listen;
    }

    info!(
        domain = %config.settings.domain,
        provider_id = %config.settings.provider_id,
        federation = config.federation.enabled,
        fail_action = ?config.management.fail_action,
        "Configuration loaded"
    );

    let authority = if config.identity.certificate_path.exists() {
        CertificateAuthority::load(&config.identity).context("Failed to load identity certificate")?
    } else {
        warn!(
            path = %config.identity.certificate_path.display(),
            "Identity certificate not found, generating a self-signed identity"
        );
        let authority = CertificateAuthority::generate(&config.settings.server_display_name, 3650)
            .context("Failed to generate identity certificate")?;
        authority
            .save(&config.identity)
            .context("Failed to save identity certificate")?;
        authority
    };

    let token_verifier: Option<Arc<dyn TokenVerifier>> = if config.federation.enabled {
        let cache = Arc::new(
            FederatedKeyCache::new(config.federation.openid_configuration_url.as_str())
                .context("Failed to create federated key cache")?,
        );
        tokio::spawn(cache.clone().run_refresher(Duration::from_secs(
            config.federation.refresh_interval_secs,
        )));
        Some(Arc::new(FederatedTokenVerifier::new(cache, &config.federation)))
    } else {
        None
    };

    let collaborators = Collaborators::defaults(&config, token_verifier);
    let state = Arc::new(AppState::new(&config, Arc::new(authority), collaborators));

    let listener = tokio::net::TcpListener::bind(&config.settings.listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.settings.listen_address))?;
    info!("Listening on {}", config.settings.listen_address);

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    state.metrics.log_summary();
    info!("Zentinel MDM stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received, stopping server");
}
