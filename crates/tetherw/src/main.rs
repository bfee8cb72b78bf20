//! tetherw, the tether worker. Enroll, attach, and serve echo work until the
//! daemon or the operator says stop.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tether_core::config::{SecurityMode, TetherConfig};
use tether_core::crypto::{decode_key, fingerprint};
use tether_core::identity::KeyStore;
use tether_core::WorkerId;
use tether_worker::transport::ChannelKeys;
use tether_worker::{
    EchoProcessor, EnrollmentClient, Endpoint, NetEnroller, NetTransport, RetryPolicy,
    TokenResolver, WorkerSession,
};

#[derive(Debug, Parser)]
#[command(name = "tetherw", version, about = "tether echo worker")]
struct Args {
    /// Config file (default: $TETHER_CONFIG or ~/.config/tether/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for key files and the persisted identity.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Storage scope for keys and identity.
    #[arg(long)]
    service_type: Option<String>,
    /// Worker type announced to the daemon.
    #[arg(long)]
    worker_type: Option<String>,
    #[arg(long)]
    request_address: Option<String>,
    #[arg(long)]
    broadcast_address: Option<String>,
    #[arg(long)]
    enrollment_address: Option<String>,
    /// One-time enrollment token.
    #[arg(long)]
    enrollment_token: Option<String>,
    /// File holding the enrollment token.
    #[arg(long)]
    enrollment_token_file: Option<PathBuf>,
    /// auto | curve | trusted
    #[arg(long)]
    security: Option<SecurityMode>,
    /// Accept undecodable attach replies.
    #[arg(long)]
    lenient_attach: bool,
    /// Debug logging (overrides RUST_LOG).
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(run(args))
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let hostname = resolve_hostname(&config);
    let security = config
        .daemon
        .security
        .resolve(&config.daemon.request_address, &config.daemon.broadcast_address);
    tracing::info!(
        service_type = %config.identity.service_type,
        worker_type = %config.worker.worker_type,
        request = %config.daemon.request_address,
        ?security,
        "tetherw starting"
    );

    let request = Endpoint::parse(&config.daemon.request_address)?;
    let broadcast = Endpoint::parse(&config.daemon.broadcast_address)?;
    let transport = NetTransport::new(request, broadcast);

    let (transport, worker_id) = match security {
        SecurityMode::Trusted => {
            let worker_id = WorkerId::new_random();
            tracing::info!(%worker_id, "trusted transport, skipping enrollment");
            (transport, worker_id)
        }
        _ => {
            let store = KeyStore::new(&config.identity.data_dir, &config.identity.service_type);
            let tokens = TokenResolver::standard(
                config.enrollment.token.clone(),
                config.enrollment.token_file.clone(),
            );
            let enroller = NetEnroller::new(Endpoint::parse(&config.daemon.enrollment_address)?);
            let mut client = EnrollmentClient::new(store.clone(), enroller, tokens, &hostname)
                .with_policy(RetryPolicy::from(&config.enrollment));
            let enrolled = client.ensure_enrolled().await.context("enrollment failed")?;

            let worker_id = WorkerId::parse(&enrolled.worker_identifier).with_context(|| {
                format!(
                    "daemon-assigned identifier {:?} is not a UUID",
                    enrolled.worker_identifier
                )
            })?;
            let keypair = store
                .load_or_generate_keypair()
                .context("failed to load worker keys")?;
            let daemon_public = decode_key(&enrolled.daemon_public_key)
                .context("persisted daemon public key is invalid")?;
            tracing::info!(
                %worker_id,
                daemon = %fingerprint(&daemon_public),
                worker = %keypair.fingerprint(),
                "sealing channels to enrolled daemon"
            );

            let keys = ChannelKeys {
                local: Arc::new(keypair),
                daemon_public,
            };
            (transport.sealed(keys), worker_id)
        }
    };

    let mut session = WorkerSession::new(transport, worker_id, config.worker.worker_type.clone())
        .lenient_attach(config.worker.lenient_attach);
    session.attach().await.context("attach failed")?;
    session
        .subscribe()
        .await
        .context("failed to subscribe to worker broadcasts")?;

    let outcome = session.run_until(&mut EchoProcessor, shutdown_signal()).await;
    session.shutdown();
    let outcome = outcome.context("worker session failed")?;
    tracing::info!(?outcome, "tetherw exiting");
    Ok(())
}

/// File (or defaults), then environment, then CLI flags.
fn load_config(args: &Args) -> Result<TetherConfig> {
    let mut config = match &args.config {
        Some(path) => TetherConfig::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            if let Err(e) = TetherConfig::write_default_if_missing(&TetherConfig::file_path()) {
                tracing::warn!(error = %e, "failed to write default config");
            }
            TetherConfig::load().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "failed to load config, using defaults");
                TetherConfig::default()
            })
        }
    };

    if let Some(v) = &args.data_dir {
        config.identity.data_dir = v.clone();
    }
    if let Some(v) = &args.service_type {
        config.identity.service_type = v.clone();
    }
    if let Some(v) = &args.worker_type {
        config.worker.worker_type = v.clone();
    }
    if let Some(v) = &args.request_address {
        config.daemon.request_address = v.clone();
    }
    if let Some(v) = &args.broadcast_address {
        config.daemon.broadcast_address = v.clone();
    }
    if let Some(v) = &args.enrollment_address {
        config.daemon.enrollment_address = v.clone();
    }
    if let Some(v) = &args.enrollment_token {
        config.enrollment.token = Some(v.clone());
    }
    if let Some(v) = &args.enrollment_token_file {
        config.enrollment.token_file = Some(v.clone());
    }
    if let Some(v) = args.security {
        config.daemon.security = v;
    }
    if args.lenient_attach {
        config.worker.lenient_attach = true;
    }
    Ok(config)
}

fn resolve_hostname(config: &TetherConfig) -> String {
    if !config.identity.hostname.is_empty() {
        return config.identity.hostname.clone();
    }
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot determine hostname");
            "unknown".into()
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;

    tracing::info!("shutdown signal received");
}

async fn ctrl_c() {
    until_signal(tokio::signal::ctrl_c(), "ctrl-c").await
}

/// Wait for `signal`. A listener that cannot be installed never fires, so
/// the worker keeps serving until the daemon terminates it.
async fn until_signal<F>(signal: F, name: &str)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!(error = %e, signal = name, "cannot listen for signal");
        std::future::pending::<()>().await;
    }
}
