use std::{io, sync::Arc};

use log::{debug, error, info};
use tokio::{net::TcpListener, signal};

use node::{Coordinator, CoordinatorConfig, server};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coordinator.json".to_string());
    let config = CoordinatorConfig::load(&config_path).map_err(io::Error::other)?;

    let (app, mut schedule_rx) = Coordinator::start(&config).await?;

    // The provisioning collaborator consumes these; until one is attached we
    // surface each recommendation in the log.
    tokio::spawn(async move {
        while let Some(schedule) = schedule_rx.recv().await {
            match serde_json::to_string(&schedule) {
                Ok(json) => info!("activation schedule: {json}"),
                Err(e) => error!("unserializable activation schedule: {e}"),
            }
        }
    });

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = config.listen_addr; "coordinator listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let app = Arc::clone(&app);

                tokio::spawn(async move {
                    let (rx, tx) = stream.into_split();
                    if let Err(e) = server::serve(app, rx, tx).await {
                        debug!("connection {addr} closed: {e}");
                    }
                });
            }
            _ = signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    app.shutdown();
    Ok(())
}
