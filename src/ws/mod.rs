//! Core WebSocket infrastructure.
//!
//! This module provides a persistent connection that is specialized for a concrete
//! protocol through the [`Handler`] trait.
//!
//! # Architecture
//!
//! - [`Client`]: Public entry point; start, stop, join and send from any thread
//! - `connection`: Supervisor loop that connects, pumps frames and reconnects with backoff
//! - `runtime`: Execution context, either a dedicated thread or a caller-supplied runtime
//! - [`Diagnostics`]: Last sent/received payloads for error reports
//! - [`Handler`]: Lifecycle callbacks with JSON decoding
//! - [`FrameHandler`]: The same callbacks for any frame encoding
//!
//! # Example
//!
//! ```ignore
//! let client = Client::new(ClientConfig::builder().host(endpoint).build(), MyHandler::default())?;
//! client.start()?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
mod runtime;
pub mod traits;
mod transport;

pub use client::Client;
pub use connection::ConnectionState;
pub use diagnostics::Diagnostics;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
