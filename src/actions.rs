//! Editor action bindings and dispatch
//!
//! Actions declared by the host UI bind either to a server-side
//! analysis command (request form, result surfaced to the caller) or to
//! a raw protocol notification (fire-and-forget). An action may ask for
//! a session reload after it runs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::session::ConnectionManager;

/// One editor action bound against the language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBinding {
    /// Display name shown in the host UI
    pub name: String,
    /// Sort order within the action group
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_binding: Option<String>,
    /// Server command name (request form) or notification method
    pub command: String,
    /// Arguments passed along with a server command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    /// Params for the notification form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Tear the session down after this action runs
    #[serde(default)]
    pub reload_on_invoke: bool,
}

impl ActionBinding {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: None,
            group_id: None,
            key_binding: None,
            command: command.into(),
            arguments: Vec::new(),
            params: None,
            reload_on_invoke: false,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_key_binding(mut self, key_binding: impl Into<String>) -> Self {
        self.key_binding = Some(key_binding.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_reload(mut self) -> Self {
        self.reload_on_invoke = true;
        self
    }

    /// Stable id derived from the display name: lowercased, with runs
    /// of whitespace collapsed to single dashes.
    pub fn action_id(&self) -> String {
        self.name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase()
    }

    /// Whether this binding dispatches as a server command request
    fn is_request(&self, server_command_prefix: &str) -> bool {
        self.command.starts_with(server_command_prefix)
    }
}

/// Routes invoked actions to the live session.
pub struct ActionDispatcher {
    manager: Arc<ConnectionManager>,
    server_command_prefix: String,
    bindings: HashMap<String, ActionBinding>,
    registration_order: Vec<String>,
}

impl ActionDispatcher {
    pub fn new(manager: Arc<ConnectionManager>, server_command_prefix: impl Into<String>) -> Self {
        Self {
            manager,
            server_command_prefix: server_command_prefix.into(),
            bindings: HashMap::new(),
            registration_order: Vec::new(),
        }
    }

    /// Register one binding; duplicate derived ids are rejected.
    pub fn register(&mut self, binding: ActionBinding) -> BridgeResult<()> {
        let id = binding.action_id();
        if self.bindings.contains_key(&id) {
            return Err(BridgeError::InvalidAction(format!(
                "action '{}' is already registered",
                id
            )));
        }
        tracing::debug!("Registered action '{}' -> {}", id, binding.command);
        self.registration_order.push(id.clone());
        self.bindings.insert(id, binding);
        Ok(())
    }

    pub fn register_all(&mut self, bindings: Vec<ActionBinding>) -> BridgeResult<()> {
        for binding in bindings {
            self.register(binding)?;
        }
        Ok(())
    }

    /// Bindings in registration order, for host UI enumeration.
    pub fn bindings(&self) -> Vec<&ActionBinding> {
        self.registration_order
            .iter()
            .filter_map(|id| self.bindings.get(id))
            .collect()
    }

    /// Invoke an action by id.
    ///
    /// Request-form actions resolve with the server's result once the
    /// response arrives; notification-form actions resolve with `None`
    /// as soon as the message is written. Nothing is written unless a
    /// session is running.
    pub async fn invoke(&self, action_id: &str) -> BridgeResult<Option<Value>> {
        let binding = self.bindings.get(action_id).ok_or_else(|| {
            BridgeError::InvalidAction(format!("unknown action '{}'", action_id))
        })?;
        let session = self.manager.require_running().await?;

        let result = if binding.is_request(&self.server_command_prefix) {
            tracing::info!("Action '{}': command {}", action_id, binding.command);
            let value = session
                .execute_command(&binding.command, binding.arguments.clone())
                .await?;
            Some(value)
        } else {
            tracing::info!("Action '{}': notify {}", action_id, binding.command);
            if let Err(e) = session.notify(&binding.command, binding.params.clone()).await {
                // Fire-and-forget: delivery failures are logged, not surfaced
                tracing::warn!("Action '{}' notification failed: {}", action_id, e);
            }
            None
        };

        if binding.reload_on_invoke {
            tracing::info!("Action '{}' requested a session reload", action_id);
            self.manager.teardown().await?;
        }

        Ok(result)
    }
}
