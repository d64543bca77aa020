use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use turnstream::db::SqliteStore;
use turnstream::ndjson_layer::NdjsonLayer;
use turnstream::redaction_layer::{RedactingMakeWriter, RedactingWriter};
use turnstream::server::build_router;
use turnstream::{AppState, Args};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "turnstream=debug,tower_http=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "turnstream.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Machine-readable trace of every event with its span fields.
    let _ = std::fs::create_dir_all("logs");
    let trace_appender = tracing_appender::rolling::daily("logs", "trace_buffer.json");
    let (trace_non_blocking, _trace_guard) = tracing_appender::non_blocking(trace_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingMakeWriter::new(std::io::stdout)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(RedactingMakeWriter::new(non_blocking))
                .with_ansi(false),
        )
        .with(NdjsonLayer::new(RedactingWriter::new(trace_non_blocking)))
        .with(tracing_error::ErrorLayer::default())
        .init();

    turnstream::logging::setup_panic_hook();

    let args = Args::parse();

    let api_key = match std::env::var("UPSTREAM_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: UPSTREAM_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let store = match SqliteStore::connect(&args.database).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    // No overall timeout: a healthy stream may run for minutes. Silence is
    // bounded by the relay's inactivity timer instead.
    let http = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let addr = format!("{}:{}", args.host, args.port);
    let state = Arc::new(AppState::new(args, Arc::new(store), http, api_key));
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("turnstream listening on {}", addr);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
