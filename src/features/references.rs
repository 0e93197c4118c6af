//! Show-references feature
//!
//! Declares an experimental capability announcing a client-side command
//! the server can invoke from its reference-count code lens. The command
//! is only registered when the server declares the matching lens
//! capability; invoking it queries the active reference provider and
//! hands the resulting locations to the editor for display.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeResult;
use crate::features::{CommandRegistry, Feature};
use crate::host::{EditorHost, ReferenceProvider};
use crate::protocol::{ClientCapabilities, Position, ReferenceContext, ServerCapabilities};

pub const SHOW_REFERENCES_COMMAND_ID: &str = "client.showReferences";

pub struct ShowReferencesFeature {
    host: Arc<dyn EditorHost>,
    provider: Arc<dyn ReferenceProvider>,
    registered_commands: Vec<String>,
    enabled: bool,
}

impl ShowReferencesFeature {
    pub fn new(host: Arc<dyn EditorHost>, provider: Arc<dyn ReferenceProvider>) -> Self {
        Self {
            host,
            provider,
            registered_commands: Vec::new(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[async_trait]
impl Feature for ShowReferencesFeature {
    fn name(&self) -> &'static str {
        "show-references"
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        if !self.enabled {
            return;
        }
        capabilities.experimental_mut().show_references_command_id =
            Some(SHOW_REFERENCES_COMMAND_ID.to_string());
    }

    async fn initialize(
        &mut self,
        capabilities: &ServerCapabilities,
        commands: &mut CommandRegistry,
    ) -> BridgeResult<()> {
        if !capabilities.has_reference_count_code_lens() || !self.enabled {
            return Ok(());
        }

        let host = Arc::clone(&self.host);
        let provider = Arc::clone(&self.provider);
        commands.register(SHOW_REFERENCES_COMMAND_ID, move |args: Vec<Value>| {
            let host = Arc::clone(&host);
            let provider = Arc::clone(&provider);
            Box::pin(async move {
                show_references(host, provider, args).await;
            })
        });
        self.registered_commands
            .push(SHOW_REFERENCES_COMMAND_ID.to_string());

        Ok(())
    }

    fn dispose(&mut self, commands: &mut CommandRegistry) {
        for id in self.registered_commands.drain(..) {
            commands.unregister(&id);
        }
    }
}

/// Handler body for the show-references command.
///
/// Arguments are `[position, referenceContext]` as sent by the server's
/// code lens. Missing document or provider results are reported, not
/// fatal; no UI action happens.
async fn show_references(
    host: Arc<dyn EditorHost>,
    provider: Arc<dyn ReferenceProvider>,
    args: Vec<Value>,
) {
    let Some(position) = args
        .first()
        .and_then(|v| serde_json::from_value::<Position>(v.clone()).ok())
    else {
        tracing::warn!("showReferences invoked without a position");
        return;
    };
    let context = args
        .get(1)
        .and_then(|v| serde_json::from_value::<ReferenceContext>(v.clone()).ok())
        .unwrap_or_default();

    let Some(uri) = host.active_document().await else {
        tracing::error!("No active document found");
        return;
    };

    let token = CancellationToken::new();
    match provider.references(&uri, position, &context, token).await {
        Ok(locations) => {
            host.show_references(&uri, position, locations).await;
        }
        Err(e) => {
            tracing::warn!("Reference query failed: {}", e);
        }
    }
}
