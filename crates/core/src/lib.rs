#![warn(missing_docs)]
//!
//! # arcbridge_core
//!
//! Core services for the arcbridge plugin: the dual-protocol message model,
//! the squad roster with optimistic-concurrency updates, and the local pipe
//! server that fans host events out to subscribed clients.
//!
//! The host integration (plugin ABI, raw callback structs, configuration
//! file handling) lives in the `arcbridge` crate; everything in here is
//! host-agnostic and fully exercised by tests.
//!

pub mod app;
pub mod combat;
pub mod extras;
pub mod info;
pub mod msg;
pub mod pipe;
pub mod squad;

pub use app::{ApplicationData, BridgeConfig};
pub use pipe::{MessageTracking, PipeHandler};

use thiserror::Error;

/// Errors raised by the core.
///
/// Transport errors stay local to the client connection they occurred on;
/// nothing in here is ever surfaced to the host callbacks.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying pipe or socket error.
    #[error("pipe i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Text protocol (de)serialization error.
    #[error("text codec error: {0}")]
    Text(#[from] serde_json::Error),
    /// Binary protocol decode error.
    #[error("unable to decode message: {0}")]
    Decode(String),
    /// The client sent an unusable subscription request.
    #[error("subscription rejected: {0}")]
    Subscription(&'static str),
}

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
