use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use supervisor::{Controller, JsonFileStore};

use crate::config::Config;
use crate::metrics::setup_metrics_routes;

mod config;
mod handlers;
mod metrics;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);

    let store = Arc::new(JsonFileStore::new(&config.config_path));
    let controller = Arc::new(Controller::new(store, config.base_directory()).await?);

    let app = handlers::add_routes(Router::new(), controller.clone(), config.max_body_size);
    let app = if config.export_prometheus {
        setup_metrics_routes(app)?
    } else {
        app
    };

    let bind = config.bind(controller.control_port());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        bind = %bind,
        definitions = %config.config_path.display(),
        "process supervisor listening"
    );

    // Abort in-flight readiness waits as soon as the signal arrives so requests drain quickly.
    let probes = controller.supervisor().shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            probes.cancel();
        })
        .await?;

    let stopping = controller.shutdown(config.stop_services_on_exit);
    if tokio::time::timeout(config.shutdown_timeout_ms.0, stopping)
        .await
        .is_err()
    {
        warn!(
            timeout_ms = config.shutdown_timeout_ms.0.as_millis() as u64,
            "timed out stopping services"
        );
    }

    info!("process supervisor stopped");
    Ok(())
}
