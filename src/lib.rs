//! Poolgate - an HTTP gateway in front of on-demand container instances
//!
//! This library provides a gateway that:
//! - Routes requests by path to a named instance, a random pool slot, or a status listing
//! - Starts instances lazily and waits for them to listen before forwarding
//! - Runs instances as local processes or Docker containers
//! - Keeps a durable diagnostic log per instance and returns it with provisioning errors
//! - Re-checks ready instances periodically and resets them when they stop answering

pub mod config;
pub mod db;
pub mod diagnostics;
pub mod docker;
pub mod error;
pub mod forward;
pub mod healthcheck;
pub mod instance;
pub mod loadbalancer;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod router;
pub mod runtime;
pub mod supervisor;
pub mod template;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
