use std::process::ExitCode;
use std::sync::Arc;

use doclet_collab::{CollabError, CollabServer, NatsBroker, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CollabError> {
    let config = ServerConfig::from_env()?;
    let broker = NatsBroker::connect(&config.broker_url).await?;

    let server = Arc::new(CollabServer::new(config, Arc::new(broker)));
    server.start().await?;

    let signals = {
        let server = server.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("shutdown requested");
            server.shutdown();
        })
    };

    let result = server.run().await;
    signals.abort();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("cannot listen for ctrl-c: {e}");
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
                log::error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
