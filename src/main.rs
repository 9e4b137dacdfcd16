use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::signal;
use tracing::{error, info, warn};

use marketplace_api as api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_sender, event_rx) = api::events::EventSender::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(event_sender);
    let event_processor = tokio::spawn(api::events::process_events(event_rx));

    // Aggregate app services used by HTTP handlers
    let services = api::handlers::AppServices::new(db_arc.clone(), event_sender.clone(), &cfg)?;

    // Background sweepers
    let expiry_sweeper = api::services::session_expiry::SessionExpirySweeper::new(
        db_arc.clone(),
        (*services.checkout_sessions).clone(),
        cfg.session_sweep_batch_size,
    )
    .spawn(Duration::from_secs(cfg.session_sweep_interval_secs));

    let orphan_sweeper = api::services::orphaned_confirmations::OrphanedConfirmationSweeper::new(
        db_arc.clone(),
        (*services.orders).clone(),
        event_sender.clone(),
        cfg.orphan_policy(),
        cfg.orphan_grace_period(),
        cfg.session_sweep_batch_size,
    )
    .spawn(Duration::from_secs(cfg.orphan_sweep_interval_secs));

    // Rate limiter, constructed once and shared by every request
    let rate_limiter = if cfg.rate_limit_enabled {
        let limiter = api::rate_limiter::RateLimiter::new(
            api::rate_limiter::RateLimitConfig::from(&cfg),
        );
        info!(
            requests_per_window = cfg.rate_limit_requests_per_window,
            window_secs = cfg.rate_limit_window_seconds,
            path_policies = limiter.config().path_policies.len(),
            "Rate limiting enabled"
        );
        Some(limiter)
    } else {
        warn!("Rate limiting disabled");
        None
    };
    let eviction = rate_limiter.as_ref().map(|limiter| {
        limiter.spawn_eviction(Duration::from_secs(cfg.rate_limit_eviction_interval_secs))
    });

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc.clone(),
        config: Arc::new(cfg.clone()),
        event_sender: event_sender.clone(),
        services,
    };
    let app = api::build_app(app_state, rate_limiter);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("marketplace-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    expiry_sweeper.abort();
    orphan_sweeper.abort();
    if let Some(handle) = eviction {
        handle.abort();
    }
    event_processor.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

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

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
