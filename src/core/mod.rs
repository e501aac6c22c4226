//! Core engine types and utilities

pub mod camera;
pub mod config;
pub mod error;
pub mod logging;
pub mod time;
pub mod tunables;
pub mod types;

pub use config::EngineConfig;
pub use error::Error;
pub use types::*;
