use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use bulk_send::api::{self, AppState, throttle::RequestThrottle};
use bulk_send::clock::{Clock, SystemClock};
use bulk_send::config::{EngineConfig, ServerConfig};
use bulk_send::events::BroadcastPublisher;
use bulk_send::jobs::{EngineDeps, JobManager};
use bulk_send::ratelimit::RateLimiter;
use bulk_send::sheet::InMemorySheetStore;
use bulk_send::transport::{HttpSender, LogSender, MessageSender};

/// How often the transport is probed while the server runs.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env().context("invalid server configuration")?;

    // Keep the guard alive so the file writer flushes on exit
    let _log_guard = init_tracing(server.log_dir.as_deref());

    let engine = EngineConfig::from_env().context("invalid engine configuration")?;
    engine.validate().context("invalid engine configuration")?;

    let sender: Arc<dyn MessageSender> = match &server.transport_url {
        Some(url) => Arc::new(
            HttpSender::new(url.clone(), server.transport_token.clone())
                .context("failed to build HTTP transport")?,
        ),
        None => Arc::new(LogSender),
    };

    eprintln!("📨 Bulk Send v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Transport: {}", sender.name());
    eprintln!(
        "   Rate: {}/min global (burst {}), max {} retries",
        engine.global_rate_per_minute, engine.global_burst, engine.max_retries
    );
    match &server.request_limits {
        Some(limits) => eprintln!(
            "   Request limits: {}/min general, {}/min upload, {}/min send",
            limits.general_per_minute, limits.upload_per_minute, limits.send_per_minute
        ),
        None => eprintln!("   Request limits: off"),
    }
    eprintln!("   API: http://0.0.0.0:{}/api", server.port);
    eprintln!("   WS:  ws://0.0.0.0:{}/ws\n", server.port);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sheets = InMemorySheetStore::new();
    let events = BroadcastPublisher::new();
    let limiter = RateLimiter::from_config(&engine, clock.clone());

    let manager = JobManager::new(
        engine,
        EngineDeps {
            sheets: sheets.clone(),
            sender,
            limiter,
            publisher: events.clone(),
            clock: clock.clone(),
        },
    );
    let _health = manager.spawn_health_monitor(HEALTH_CHECK_INTERVAL);
    let throttle = server
        .request_limits
        .map(|limits| RequestThrottle::new(limits, clock.clone()));

    let app = api::router(
        AppState {
            manager: manager.clone(),
            sheets,
            events,
            throttle,
        },
        &server.allowed_origins,
    );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "Bulk send server started");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    manager.shutdown().await;
    Ok(())
}

fn init_tracing(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bulk-send.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
