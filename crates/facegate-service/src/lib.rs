//! facegate-service — runs the face pipeline on a worker pool, keeps
//! encrypted enrollment profiles in SQLite and exposes the verification
//! façade used by the CLI.

pub mod config;
pub mod engine;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle};
pub use service::{BiometricService, ServiceError, ServiceStatus};
pub use store::{OverrideRecord, ProfileInfo, ProfileStore, StoreError};
