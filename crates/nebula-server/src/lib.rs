//! # nebula-server
//!
//! WebSocket front end for the Nebula gateway: configuration loading, the
//! HTTP routes and Prometheus metrics.

pub mod config;
pub mod handlers;
pub mod metrics;
