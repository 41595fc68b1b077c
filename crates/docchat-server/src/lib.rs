//! HTTP server and command-line front end for `docchat-relay`.

/// Terminal question answering.
pub mod ask;
/// Command-line arguments and `.env` loading.
pub mod config;
/// Tracing subscriber setup.
pub mod observability;
/// Axum routes for chat and history.
pub mod server;

pub use server::{AppState, router, serve};
