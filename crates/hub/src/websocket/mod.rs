//! WebSocket relay between the automated-reply producer and operator viewers
//!
//! # Architecture
//!
//! - **Connection**: one transport session with its role, liveness and outbound queue
//! - **Registry**: every live connection plus the producer routing slot
//! - **Router**: role/kind based fan-out with per-connection backpressure
//! - **State**: registry and router shared across handlers
//! - **Handler**: Axum upgrade route running the handshake-then-route protocol

pub mod connection;
pub mod handler;
pub mod registry;
pub mod router;
pub mod state;

pub use handler::ws_handler;
pub use registry::ConnectionRegistry;
pub use router::EventRouter;
pub use state::RelayState;
