//! Type definitions for extensions and lifecycle requests

mod extension_types;
mod request_types;

pub use extension_types::*;
pub use request_types::*;
