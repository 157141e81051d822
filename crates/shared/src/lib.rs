//! Relaydesk Shared Types and Event Schema
//!
//! This crate contains the wire schema, domain types and frame validation shared
//! by the relay hub and the operator-side sync client.

pub mod error;
pub mod events;
pub mod types;

pub use error::*;
pub use events::*;
pub use types::*;
