use crate::cycle::CycleDriver;
use crate::kubernetes::KubeOrchestrator;
use crate::oci_registry::OciRegistryResolver;
use crate::report::Reporter;
use crate::scheduler::{FireSource, Scheduler};
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

mod config;
mod credentials;
mod cycle;
mod error;
mod image_reference;
mod kubernetes;
mod oci_registry;
mod orchestrator;
mod policy;
mod report;
mod rollout;
mod scheduler;
#[cfg(test)]
mod testing;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/app/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = config::load_config(&config_path)?;
    let engine = config.engine_config()?;
    let settings = config.cycle_settings()?;

    let level = if engine.debug_logging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    info!(
        "Starting {} {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    info!("Loaded config from {}", config_path);
    info!("Watching {}", engine.eligibility.describe());

    // An invalid schedule must stop the process before any cycle runs
    let (fire_source, fires) = FireSource::new(&engine.trigger).await?;

    let kube_client = kubernetes::create_client(settings.call_timeout).await?;
    let orchestrator = KubeOrchestrator::new(kube_client, config.namespace.clone());
    info!("Watching workloads in namespace {}", orchestrator.namespace());

    let http_client =
        oci_registry::create_client(&config.tls.ca_certificate_paths, settings.call_timeout)?;
    let credentials = config.credentials();
    info!("Configured credentials for {} registries", credentials.len());
    let resolver = OciRegistryResolver::new(
        http_client,
        Arc::new(credentials),
        config.insecure_registries.clone(),
        config.feature_flags.enable_jfrog_artifactory_fallback,
    );

    let driver = CycleDriver::new(
        Arc::new(orchestrator),
        Arc::new(resolver),
        Arc::new(engine.eligibility),
        settings,
    );
    let reporter = Reporter::new();

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    let app = webserver::create_app(reporter.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    fire_source.start().await?;
    let stats = Scheduler::new(Arc::new(driver), reporter)
        .run(fires, shutdown.clone())
        .await;
    fire_source.shutdown().await;
    shutdown.cancel();

    server.await??;
    info!(
        "Stopped after {} cycles ({} fire events dropped while a cycle was running)",
        stats.cycles_started, stats.fires_dropped
    );
    Ok(())
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
