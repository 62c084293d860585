use carbon::bus::EventBus;
use carbon::planes::control::{ConnectionPool, QueryWorkers};
use carbon::planes::data::{DispatchSettings, Dispatcher};
use shared::config::Config;
use std::sync::Arc;
use storage_engine::{MokaBackend, MokaConnectionFactory};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Carbon memcached proxy");

    // Load environment variables
    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Arc::new(Config::from_env());
    let bus = EventBus::new();

    // ============================================
    // STEP 1: Open the connection pool
    // ============================================
    let memcached = &config.memcached;
    info!(
        "Connecting to {} with {} connection(s)",
        memcached.servers.join(" "),
        memcached.connections
    );

    let backend = Arc::new(MokaBackend::new(&memcached.servers, None)?);
    let factory = MokaConnectionFactory::new(backend);
    let probe = memcached
        .validate_on_connect
        .then_some(memcached.operation_timeout);

    let pool = match ConnectionPool::connect(&factory, memcached.connections, probe).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!("{}; no handler registered at '{}'", e, config.address);
            return Err(e.into());
        }
    };

    // ============================================
    // STEP 2: Register the dispatcher
    // ============================================
    let dispatcher = Dispatcher::new(
        Arc::clone(&pool),
        QueryWorkers::new(memcached.query_workers, memcached.query_timeout),
        DispatchSettings::from(memcached),
    );
    let registration = bus.register_handler(config.address.clone(), dispatcher)?;

    // ============================================
    // STEP 3: Spawn HTTP Server Task
    // ============================================
    let http_listener = TcpListener::bind((config.host.as_str(), config.http.port())).await?;
    info!(
        "HTTP Server listening on {}://{}:{}",
        config.http.scheme(),
        config.host,
        config.http.port()
    );

    let http_router = server_http::build_router(server_http::AppState::new(
        bus.clone(),
        config.bridge_reply_timeout,
    ));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_router)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    // ============================================
    // STEP 4: Spawn TCP Server Task
    // ============================================
    let tcp_listener = TcpListener::bind((config.host.as_str(), config.tcp.port())).await?;
    let tcp_handle = tokio::spawn(server_tcp::serve(
        tcp_listener,
        bus.clone(),
        config.bridge_reply_timeout,
    ));

    // ============================================
    // STEP 5: Wait for shutdown signal
    // ============================================
    info!("Carbon proxy started, requests accepted at '{}'", config.address);
    info!(
        "  - HTTP: {}://{}:{}/bus/{}",
        config.http.scheme(),
        config.host,
        config.http.port(),
        config.address
    );
    info!(
        "  - TCP:  {}://{}:{}",
        config.tcp.scheme(),
        config.host,
        config.tcp.port()
    );

    tokio::select! {
        _ = http_handle => info!("HTTP server task completed"),
        result = tcp_handle => match result {
            Ok(Err(e)) => error!("TCP server stopped: {}", e),
            _ => info!("TCP server task completed"),
        },
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    registration.unregister().await;
    pool.shutdown_all();

    info!("Carbon proxy shut down");
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
}
