//! # extman-core
//!
//! Core library for extman providing:
//! - Type definitions for extensions, catalog entries and lifecycle requests
//! - Configuration file parsing (extman.yaml)
//! - Error types shared by the lifecycle crate

pub mod config;
pub mod error;
pub mod types;

pub use config::ManagementConfig;
pub use error::{Error, Result};
