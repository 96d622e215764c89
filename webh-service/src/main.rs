//! webh demo service
//!
//! - Heartbeat at `/ping` (configurable)
//! - Request logging with correlation ids
//! - Optional CORS and compression
//! - `GET /hello`, `GET /test`, `POST /echo`
//!
//! Stops on Ctrl+C after letting in-flight requests finish.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use webh::{HttpServer, LoggerOptions};

mod config;
mod handlers;
mod telemetry;

use config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let env_file = config::load_environment();
    let args = Args::parse();

    telemetry::init(args.log_json);

    if let Some(report) = env_file {
        info!(
            "Loaded {} environment variables from {:?} ({} skipped - already set)",
            report.loaded, report.path, report.skipped
        );
    }

    let mut builder = HttpServer::builder()
        .host(args.host.clone())
        .port(args.port)
        .heartbeat(args.heartbeat.clone())
        .logger(args.service_name.clone(), LoggerOptions::default());

    if let Some(cors) = args.cors() {
        info!("CORS enabled for {:?}", cors.allowed_origins);
        builder = builder.cors(cors);
    }
    if let Some(compress) = args.compress() {
        info!("Compression enabled at level {}", compress.level);
        builder = builder.compress(compress);
    }

    let mut server = builder.build()?.merge(handlers::router());
    if let Some(ref dir) = args.static_dir {
        server = server.file_server(dir)?;
    }

    server.start().await;
    Ok(())
}
