//! Momentum Common - Shared configuration and logging for the momentum services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Logging setup with noise filtering

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod config_loader;
pub mod logging;

pub use config::{
    CacheConfig, Config, CredentialsConfig, MarketDataConfig, ObservabilityConfig,
    QualificationConfig, SnapshotConfig, StorageConfig,
};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::logging::init_logging;
}
