//! Server-side client PSK registry.

mod client_registry;

pub use client_registry::{is_valid_client_id, is_valid_psk_size, ClientRegistry};
