//! VEIL client: identity/bootstrap plus the event loop that dials a
//! server and drives the resulting tunnel.

mod bootstrap;
#[allow(clippy::module_inception)]
mod client;

pub use bootstrap::*;
pub use client::*;
