#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod service;
pub mod source;
pub mod store;
pub mod worker;

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
