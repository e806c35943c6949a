//! VEIL server: client registry, session table, and the event loop that
//! ties them to a [`crate::transport::VeilSocket`].

#[allow(clippy::module_inception)]
mod server;
mod session_table;

pub use server::*;
pub use session_table::*;
