use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use melotts_server::args::Args;
use melotts_server::bridge::SynthesisBridge;
use melotts_server::protocol::{READY_MARKER, SynthesisDriver};
use melotts_server::server::{self, AppState};
use melotts_server::supervisor::Supervisor;
use melotts_server::{config, logging, queue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("Starting melotts synthesis server");

    let project_root = args.resolved_project_root()?;
    let arguments_path = args.arguments_path(&project_root);
    let child_args = match config::load_child_arguments(&arguments_path) {
        Ok(child_args) => child_args,
        Err(e) => {
            error!("Error loading child arguments: {:#}", e);
            Vec::new()
        }
    };

    let launch = args.launch_spec(&project_root, child_args);
    let (supervisor, mut conversation) = Supervisor::start(&launch)
        .context("Failed to start the melotts process. The server will not run")?;
    // Dropping the last handle terminates the child on every exit path.
    let supervisor = Arc::new(supervisor);

    supervisor
        .await_ready(&mut conversation.stdout, READY_MARKER, args.ready_timeout())
        .await
        .context("Melotts process never became ready. The server will not run")?;

    let driver = SynthesisDriver::new(args.protocol_settings());
    let (jobs, _worker) = queue::spawn_worker(conversation, driver, supervisor.clone());
    let state = AppState::new(SynthesisBridge::new(jobs), supervisor.clone());

    let listener = TcpListener::bind(args.listen_addr())
        .await
        .with_context(|| format!("binding {}", args.listen_addr()))?;

    let result = tokio::select! {
        served = server::serve(listener, state) => served,
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    supervisor.terminate();
    info!("Server stopped");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
