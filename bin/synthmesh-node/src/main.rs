//! A single node of a synthetic service mesh.
//!
//! Each node burns a configurable amount of CPU and memory per request, forwards the request to its downstream
//! targets, and answers with a synthetic payload, reporting a span per hop. Wiring many nodes together reproduces an
//! arbitrary call topology for benchmarking tracing pipelines, load balancers, and admission control.

#![deny(warnings)]
#![deny(missing_docs)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser as _;
use synthmesh_core::{
    error::{ErrorContext as _, GenericError},
    LogReporter, NodeEngine, SpanReporter, Tracer,
};
use tokio::{
    net::TcpListener,
    select,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod app;
use self::app::initialize_app_router;

mod caller;
use self::caller::HttpCaller;

mod cli;
use self::cli::Cli;

mod pid;
use self::pid::PidFile;

mod zipkin;
use self::zipkin::ZipkinReporter;

const EXPORTER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => info!("synthmesh-node stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    info!(name = %cli.name, "synthmesh-node starting...");

    let config = cli.node_config()?;
    let routes = Arc::new(cli.route_table()?);
    let pid_file = PidFile::create(&cli.pid_path, config.name())?;
    info!(path = %pid_file.path().display(), "Wrote PID file.");

    let profile = config.load().profile();
    info!(
        cpu_duty_cycle = profile.cpu_duty_cycle,
        memory_units = profile.memory_units,
        memory_unit_size = %config.memory_unit_size(),
        process_time_ms = config.process_time().as_millis() as u64,
        requests_per_second = ?config.requests_per_second(),
        queue_capacity = config.admission_capacity(),
        dispatch_mode = %config.dispatch_mode(),
        targets = ?config.targets(),
        routes = ?routes.route_keys(),
        root = config.is_root(),
        "Node configured."
    );

    let (reporter, exporter): (Arc<dyn SpanReporter>, _) = match &cli.zipkin {
        Some(endpoint) => {
            let client = reqwest::Client::builder()
                .build()
                .error_context("Failed to build span export client.")?;
            let (reporter, exporter) = ZipkinReporter::spawn(endpoint, client);
            info!(%endpoint, "Exporting spans to Zipkin.");
            let reporter: Arc<dyn SpanReporter> = Arc::new(reporter);
            (reporter, Some(exporter))
        }
        None => {
            let reporter: Arc<dyn SpanReporter> = Arc::new(LogReporter);
            (reporter, None)
        }
    };
    let tracer = Tracer::new(config.name().to_string(), cli.sampling, reporter);

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let caller = Arc::new(HttpCaller::new(config.port())?);
    let engine = Arc::new(NodeEngine::new(config, Arc::clone(&routes), caller, tracer));
    let app = initialize_app_router(Arc::clone(&engine), routes);

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    spawn_signal_handlers(shutdown_tx).error_context("Failed to configure signal handlers.")?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_error_context(|| format!("Failed to bind to {}.", listen_addr))?;

    info!("synthmesh-node started: listening on {}", listen_addr);

    let shutdown_engine = Arc::clone(&engine);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.unwrap_or(());
            shutdown_engine.shutdown();
        })
        .await
        .error_context("HTTP server failed.")?;

    // The engine holds the last reference to the span reporter, so dropping it lets the exporter drain and exit.
    drop(engine);
    if let Some(exporter) = exporter {
        if tokio::time::timeout(EXPORTER_SHUTDOWN_TIMEOUT, exporter).await.is_err() {
            warn!("Timed out waiting for span exporter to flush.");
        }
    }

    drop(pid_file);
    Ok(())
}

fn spawn_signal_handlers(shutdown_tx: mpsc::Sender<()>) -> Result<(), GenericError> {
    let mut sigint_handler = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm_handler = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    tokio::spawn(async move {
        select! {
            _ = sigint_handler.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm_handler.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }

        if let Err(e) = shutdown_tx.send(()).await {
            error!("Failed to send shutdown signal: {:?}", e);
        }
    });

    Ok(())
}
