//! Host collaborator contracts
//!
//! The bridge never calls back into closures threaded through its
//! internals; it emits `BridgeEvent`s on a channel and invokes the
//! `EditorHost` trait for UI behavior it needs from the embedding
//! editor.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeResult;
use crate::protocol::{Diagnostic, Location, Position, ReferenceContext};
use crate::session::ClientState;

/// Events the bridge surfaces to the host
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The session moved to a new lifecycle state
    StateChanged(ClientState),
    /// The session ended; the transport is gone. No auto-restart.
    Closed,
    /// A failure with a human-readable cause
    Error(String),
    /// The server published diagnostics for a document
    DiagnosticsPublished {
        uri: String,
        diagnostics: Vec<Diagnostic>,
    },
}

/// UI surface the bridge asks the embedding editor for.
#[async_trait]
pub trait EditorHost: Send + Sync {
    /// URI of the currently focused document, if any
    async fn active_document(&self) -> Option<String>;

    /// Display a location list for a references result
    async fn show_references(&self, uri: &str, position: Position, locations: Vec<Location>);

    /// Re-render the current content without touching the connection
    async fn refresh(&self);
}

/// Queries references for a position, honoring scoped cancellation.
#[async_trait]
pub trait ReferenceProvider: Send + Sync {
    async fn references(
        &self,
        uri: &str,
        position: Position,
        context: &ReferenceContext,
        token: CancellationToken,
    ) -> BridgeResult<Vec<Location>>;
}
