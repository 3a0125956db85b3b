//! Termgate - one port in front of many terminal-backed processes
//!
//! This library multiplexes browser traffic onto locally spawned backend
//! processes:
//! - Routes HTTP and WebSocket traffic by URL path prefix to per-route backends
//! - Spawns one backend process per route, each on its own local port
//! - Confirms backends are listening before forwarding any traffic
//! - Restarts crashed backends with bounded exponential backoff
//! - Enforces per-route concurrent session limits
//! - Relays WebSocket traffic byte-for-byte so the terminal protocol
//!   passes through untouched

pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod process;
pub mod provision;
pub mod proxy;
pub mod sessions;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
