//! Relaydesk relay hub
//!
//! Accepts long-lived WebSocket connections from operator viewers and the
//! automated-reply producer, classifies them by handshake, and relays events
//! between them without retaining conversation state.

pub mod config;
pub mod error;
pub mod logging;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{HubError, HubResult};
pub use routes::create_router;
pub use state::AppState;

/// Serve the relay on an already bound listener until the future resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
