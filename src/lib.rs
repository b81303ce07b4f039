// src/lib.rs
pub mod alerts;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod geo;
pub mod subscription;
pub mod types;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "console=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
