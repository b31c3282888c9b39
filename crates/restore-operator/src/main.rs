//! etcd restore operator - leader-elected EtcdRestore controller

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use restore_common::telemetry::{init_telemetry, log_build_info, BuildInfo, TelemetryConfig};
use restore_operator::bootstrap::{run_operator, Bootstrap, BootstrapError};
use restore_operator::config::OperatorArgs;
use restore_operator::crd::EtcdRestore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();

    if args.crd {
        let crd = serde_yaml::to_string(&EtcdRestore::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let telemetry = TelemetryConfig::default();
    init_telemetry(&telemetry)?;
    log_build_info(
        &telemetry,
        &BuildInfo {
            version: env!("CARGO_PKG_VERSION"),
            git_sha: env!("GIT_SHA"),
        },
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let result = run_operator(
        &args,
        |var| std::env::var(var).ok(),
        hostname::get,
        |settings| {
            let settings = settings.clone();
            async move {
                let client = Client::try_default().await?;
                Ok::<_, BootstrapError>(Bootstrap::for_cluster(client, &settings))
            }
        },
        shutdown,
    )
    .await;

    if let Err(e) = result {
        let stage = match &e {
            BootstrapError::Startup(inner) if inner.is_startup_config() => "configuration",
            _ => "runtime",
        };
        error!(error = %e, stage, "etcd restore operator stopped");
        std::process::exit(1);
    }

    info!("etcd restore operator shut down");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Error handling Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut handler) => {
                handler.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = sigterm => info!("Received SIGTERM signal"),
    }
    shutdown.cancel();
}
