//! Workspace-folder feature
//!
//! Declares workspace-folder support so the server scopes analysis to
//! the folder advertised in the initialize params.

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::features::{CommandRegistry, Feature};
use crate::protocol::{ClientCapabilities, ServerCapabilities};

#[derive(Default)]
pub struct WorkspaceFoldersFeature;

impl WorkspaceFoldersFeature {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Feature for WorkspaceFoldersFeature {
    fn name(&self) -> &'static str {
        "workspace-folders"
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        capabilities.workspace_mut().workspace_folders = Some(true);
    }

    async fn initialize(
        &mut self,
        _capabilities: &ServerCapabilities,
        _commands: &mut CommandRegistry,
    ) -> BridgeResult<()> {
        Ok(())
    }

    fn dispose(&mut self, _commands: &mut CommandRegistry) {}
}
