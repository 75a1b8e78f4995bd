//! Configuration loading and management

mod loader;

pub use loader::ManagementConfig;
