//! JSON HTTP API and event WebSocket.

pub mod api;
pub mod server;
pub mod ws;

pub use server::{ServerConfig, build_router, start_server};
