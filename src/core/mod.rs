//! Core constants and error types shared by every layer.

#[cfg(feature = "transport")]
mod config;
mod constants;
mod error;

#[cfg(feature = "transport")]
pub use config::*;
pub use constants::*;
pub use error::*;
