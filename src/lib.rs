//! Langbridge - Editor-to-Language-Server Bridge
//!
//! Connects an in-browser editor host to a WebSocket-served language
//! server: transport framing, the initialize handshake, capability-gated
//! features, and editor action dispatch.

pub mod actions;
pub mod config;
pub mod error;
pub mod features;
pub mod host;
pub mod protocol;
pub mod session;
pub mod startup;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use actions::{ActionBinding, ActionDispatcher};
pub use config::{InitOptions, LanguageServerUrl, SessionConfig};
pub use error::{BridgeError, BridgeResult};
pub use session::{ClientState, ConnectionManager, Session};
