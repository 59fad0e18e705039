//! Keepalive web endpoint for hosting-platform liveness probes.
//!
//! Runs on its own OS thread with a dedicated single-threaded runtime,
//! fully decoupled from the message dispatcher.

use axum::Router;
use axum::routing::get;
use tracing::{error, info};

fn router() -> Router {
    Router::new().route("/", get(|| async { "I am alive!" }))
}

/// Spawn the liveness responder on a dedicated thread.
pub fn spawn(port: u16) {
    let spawned = std::thread::Builder::new()
        .name("liveness".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to build liveness runtime: {e}");
                    return;
                }
            };

            runtime.block_on(async move {
                let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
                let listener = match tokio::net::TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!("Failed to bind liveness endpoint on {addr}: {e}");
                        return;
                    }
                };
                info!("Liveness endpoint listening on {addr}");

                if let Err(e) = axum::serve(listener, router()).await {
                    error!("Liveness server error: {e}");
                }
            });
        });

    if let Err(e) = spawned {
        error!("Failed to spawn liveness thread: {e}");
    }
}
