use crate::cli::ServeArgs;
use crate::infra::{provision_seeds, AppState};
use crate::routes::with_operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use resido::config::AppConfig;
use resido::error::AppError;
use resido::telemetry;
use resido::{Engine, EngineParts};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let engine = Engine::new(EngineParts::from_config(&config)?)?;
    provision_seeds(&engine, &args.tenants)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let app = with_operational_routes(engine.router())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let workers = engine.start_workers();
    let (scheduler, scheduler_shutdown) =
        engine.spawn_scheduler(Duration::from_secs(args.scheduler_period_secs.max(1)));

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, workers = workers.size(), "resido engine ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    readiness_flag.store(false, Ordering::Release);
    let _ = scheduler_shutdown.send(()).await;
    let _ = scheduler.await;
    workers.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
