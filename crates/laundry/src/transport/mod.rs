//! Transport layer for the laundry service.
//!
//! Currently provides HTTP transport via axum.

pub mod http;

pub use http::{ServerConfig, cancel_on_signal, serve};
