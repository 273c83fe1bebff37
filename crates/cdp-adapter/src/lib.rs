//! Chromium DevTools Protocol transport used by the preview host.
//!
//! Attaches to a browser already exposing a DevTools websocket and multiplexes raw
//! commands and events over it. Everything page-specific (targets, worlds, bindings)
//! lives with the caller.

pub mod config;
pub mod error;
pub mod transport;

pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use transport::{ChromiumTransport, CdpTransport, CommandTarget, TransportEvent};
