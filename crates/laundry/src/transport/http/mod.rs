//! JSON-over-HTTP transport.

mod routes;
mod server;

pub use routes::routes;
pub use server::{ServerConfig, cancel_on_signal, serve};
