use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use sblite::{config, features, middleware};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load configuration first; the log level comes from it.
    config::init();
    let config = match config::Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Open the embedded store: WAL mode, many readers, one writer.
    let options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .expect("Failed to open database");

    // Internal schema
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run internal migrations");

    // Create services (clonable for router state)
    let meta_service = features::meta::MetaService::new(pool.clone());
    let rls_service = features::rls::RlsService::new(pool.clone());
    let auth_service = features::auth::service::AuthService::new(pool.clone(), config.clone());
    let rest_service =
        features::rest::RestService::new(pool.clone(), meta_service.clone(), rls_service.clone());
    let admin_service =
        features::admin::AdminService::new(pool.clone(), meta_service.clone(), rls_service.clone());
    let migration_service =
        features::migrate::MigrationService::new(pool.clone(), meta_service.clone());
    let metrics_service =
        features::metrics::MetricsService::new(pool.clone(), config.metrics_enabled);

    // User migrations from the configured directory
    let applied = migration_service
        .apply_pending(Path::new(&config.migrations_dir))
        .await
        .expect("Failed to apply migrations");
    if applied > 0 {
        tracing::info!(count = applied, "Applied pending migrations");
    }

    // First boot mints the anon / service-role API keys (logged once).
    auth_service
        .ensure_api_keys()
        .await
        .expect("Failed to mint API keys");

    let config_arc = Arc::new(config.clone());

    let rate_limiter = Arc::new(middleware::rate_limit::RateLimiter::new(
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_secs),
    ));
    let limiter_clone = rate_limiter.clone();
    tokio::spawn(async move {
        middleware::rate_limit::cleanup_task(limiter_clone).await;
    });

    if config.metrics_enabled {
        tokio::spawn(metrics_service.clone().run_flusher());
    }

    let auth_router = Router::new()
        .merge(features::auth::routes::public_auth_routes())
        .merge(
            features::auth::routes::protected_auth_routes()
                .layer(axum::middleware::from_fn(middleware::auth::require_auth)),
        )
        .with_state(auth_service.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/auth/v1", auth_router)
        .nest(
            "/rest/v1",
            features::rest::rest_routes().with_state(rest_service),
        )
        .nest(
            "/admin/v1",
            features::admin::routes::admin_routes()
                .with_state(admin_service)
                .layer(axum::middleware::from_fn(
                    middleware::auth::require_service_role,
                )),
        )
        .layer(axum::middleware::from_fn(
            features::metrics::metrics_middleware,
        ))
        .layer(axum::Extension(metrics_service.clone()))
        .layer(axum::middleware::from_fn(
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(rate_limiter))
        .layer(axum::middleware::from_fn(
            middleware::auth::auth_context_middleware,
        ))
        .layer(axum::Extension(config_arc))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!(%addr, "Server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    // Last flush before exit so buffered metrics are not lost.
    if let Err(e) = metrics_service.flush().await {
        tracing::error!(error = %e, "Final metrics flush failed");
    }
}

/// A panicking handler must still answer with the error envelope; the
/// panic details stay in the logs.
fn handle_panic(
    _err: Box<dyn std::any::Any + Send + 'static>,
) -> axum::http::Response<axum::body::Body> {
    tracing::error!("Recovered from handler panic");
    let body = serde_json::json!({
        "error": {"code": "StorageError", "message": "Internal error"}
    });
    axum::http::Response::builder()
        .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "OK",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
