//! offline-dl library crate.
//!
//! Background HLS downloads with a durable task store, a concurrency-limited
//! scheduler and connectivity awareness.

pub mod config;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod network;
pub mod notification;
pub mod store;
pub mod utils;

pub use error::{Error, Result};
