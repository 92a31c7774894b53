use berth_core::config::CoreConfig;
use berth_core::logging;
use berth_core::signal::StopSignal;
use berth_server::{Services, router};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    logging::init();

    if let Err(message) = run().await {
        tracing::error!(%message, "berth exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = CoreConfig::from_env().map_err(|error| error.to_string())?;
    let listen_addr = config.listen_addr.clone();
    let services = Services::from_config(config).map_err(|error| error.to_string())?;

    let stop = StopSignal::new();
    let background = services.spawn_background(&stop);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|error| format!("failed to bind {listen_addr}: {error}"))?;
    tracing::info!(addr = %listen_addr, "berth listening");

    let shutdown = {
        let stop = stop.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            stop.stop();
        }
    };
    let served = axum::serve(listener, router(services.app_state()))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|error| format!("server error: {error}"));

    // the loops also end when the server fails on its own
    stop.stop();
    for handle in background {
        if let Err(error) = handle.await {
            tracing::error!(%error, "background loop panicked");
        }
    }
    served
}
