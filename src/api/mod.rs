//! HTTP API Module
//!
//! Provides a REST API for monitoring and managing the proxy.

mod http;

pub use http::{AppState, HttpServer};
