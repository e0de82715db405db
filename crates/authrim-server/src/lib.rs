//! # authrim-server
//!
//! Wires configuration, the ephemeral-state actors, the relational stores
//! and the HTTP surface into a runnable authorization server.

pub mod builder;

pub use builder::{Server, ServerBuilder};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initializes tracing from `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
