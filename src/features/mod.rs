//! Pluggable protocol features
//!
//! A feature contributes client capabilities before negotiation, reacts
//! to the server's capabilities afterwards, and is disposed exactly once
//! on session teardown. New features implement the three-method contract
//! without touching the connection manager.

pub mod references;
pub mod workspace;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ClientCapabilities, ServerCapabilities};

pub use references::{ShowReferencesFeature, SHOW_REFERENCES_COMMAND_ID};
pub use workspace::WorkspaceFoldersFeature;

/// A protocol extension.
///
/// A feature that declares a capability must also implement the handler
/// for it; that pairing is verified by tests, not runtime checks.
#[async_trait]
pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;

    /// Contribute client capabilities. Runs for every registered
    /// feature before `initialize` is sent.
    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities);

    /// React to the negotiated server capabilities. Runs after the
    /// server's response, in registration order.
    async fn initialize(
        &mut self,
        capabilities: &ServerCapabilities,
        commands: &mut CommandRegistry,
    ) -> BridgeResult<()>;

    /// Release anything registered during `initialize`.
    fn dispose(&mut self, commands: &mut CommandRegistry);
}

type CommandHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Client-side commands the server (or host UI) may invoke by id.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns `false` if the id was taken.
    pub fn register<F>(&mut self, id: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.handlers.contains_key(&id) {
            tracing::warn!("Command '{}' already registered", id);
            return false;
        }
        self.handlers.insert(id, Arc::new(handler));
        true
    }

    pub fn unregister(&mut self, id: &str) -> bool {
        self.handlers.remove(id).is_some()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Invoke a command by id. Unregistered ids are a no-op, not an
    /// error; returns whether a handler ran.
    pub async fn invoke(&self, id: &str, args: Vec<Value>) -> bool {
        match self.handlers.get(id) {
            Some(handler) => {
                handler(args).await;
                true
            }
            None => {
                tracing::debug!("No handler for command '{}'", id);
                false
            }
        }
    }
}

/// Ordered set of features owned by one session.
pub struct FeatureRegistry {
    features: Vec<Box<dyn Feature>>,
    disposed: bool,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
            disposed: false,
        }
    }

    pub fn register(&mut self, feature: Box<dyn Feature>) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Capability contribution, in registration order.
    pub fn contribute(&self, capabilities: &mut ClientCapabilities) {
        for feature in &self.features {
            feature.fill_client_capabilities(capabilities);
        }
    }

    /// Capability consumption, in registration order. A failing feature
    /// is isolated: it is logged and the others still run.
    pub async fn consume(
        &mut self,
        capabilities: &ServerCapabilities,
        commands: &mut CommandRegistry,
    ) {
        for feature in &mut self.features {
            if let Err(e) = feature.initialize(capabilities, commands).await {
                let err = BridgeError::Feature {
                    feature: feature.name(),
                    message: e.to_string(),
                };
                tracing::warn!("{}", err);
            }
        }
    }

    /// Dispose every feature exactly once.
    pub fn dispose(&mut self, commands: &mut CommandRegistry) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for feature in &mut self.features {
            feature.dispose(commands);
        }
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
