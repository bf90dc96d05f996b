//! Live transcription bridge entry point

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lt_config::{load_settings, Settings};
use lt_server::{create_router, AppState, RoomRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("LT_CONFIG_FILE").ok();
    let settings = match load_settings(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging.
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&settings);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = settings.port,
        "starting live transcription bridge"
    );

    if !settings.is_hpb_configured() {
        tracing::warn!("HPB not configured; set LT_HPB_URL and LT_HPB_INTERNAL_SECRET");
    }
    if !settings.is_stt_configured() {
        tracing::warn!(
            "speech service not configured; set LT_STT_WORKSPACE, LT_STT_KEY and LT_STT_SECRET"
        );
    }

    let registry = RoomRegistry::new(settings.clone());

    let shutdown = Arc::new(Notify::new());
    lt_server::watchdog::spawn(settings.max_memory_mb, shutdown.clone());

    let app = create_router(AppState {
        registry: registry.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    registry.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or a watchdog-triggered shutdown.
async fn shutdown_signal(shutdown: Arc<Notify>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = shutdown.notified() => {
            tracing::info!("watchdog requested shutdown");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "lt_server={0},lt_transport={0},lt_pipeline={0},lt_core={0},tower_http=debug",
            settings.log_level
        )
        .into()
    });

    let fmt_layer = if settings.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
