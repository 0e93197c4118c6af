//! Session configuration surface
//!
//! Consumed once per session: where the language server lives, which
//! documents it covers, how it is initialized, and which editor actions
//! are bound against it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::ActionBinding;

/// The language server URL.
///
/// Formats to a `ws://` or `wss://` address; a non-empty `path` is
/// normalized to start with a slash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguageServerUrl {
    pub host: String,
    pub port: u16,
    pub secured: bool,
    pub path: String,
}

impl LanguageServerUrl {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secured: true,
            path: String::new(),
        }
    }

    pub fn insecure(mut self) -> Self {
        self.secured = false;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// The formatted language server URL as a string
    pub fn formatted(&self) -> String {
        let schema = if self.secured { "wss" } else { "ws" };
        let path = if !self.path.is_empty() && !self.path.starts_with('/') {
            format!("/{}", self.path)
        } else {
            self.path.clone()
        };
        format!("{}://{}:{}{}", schema, self.host, self.port, path)
    }
}

impl fmt::Display for LanguageServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

/// Initialization options: a static value or a thunk computed at
/// connect time.
#[derive(Clone)]
pub enum InitOptions {
    Static(Value),
    Lazy(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl InitOptions {
    pub fn resolve(&self) -> Value {
        match self {
            InitOptions::Static(value) => value.clone(),
            InitOptions::Lazy(thunk) => thunk(),
        }
    }
}

impl fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitOptions::Static(value) => f.debug_tuple("Static").field(value).finish(),
            InitOptions::Lazy(_) => f.debug_tuple("Lazy").field(&"<thunk>").finish(),
        }
    }
}

impl From<Value> for InitOptions {
    fn from(value: Value) -> Self {
        InitOptions::Static(value)
    }
}

/// Configuration for one bridge session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Language ids the session covers
    pub document_selector: Vec<String>,
    /// Language-server specific initialization options
    pub initialization_options: Option<InitOptions>,
    /// Workspace folder advertised during negotiation
    pub workspace_folder: Option<PathBuf>,
    /// Address of the language server
    pub server_url: LanguageServerUrl,
    /// Declared editor actions, in UI registration order
    pub actions: Vec<ActionBinding>,
    /// Commands with this prefix are server-side analysis commands and
    /// dispatch as requests; everything else is a notification.
    pub server_command_prefix: String,
    /// Timeout applied to each outbound request
    pub request_timeout: Duration,
}

impl SessionConfig {
    pub fn new(server_url: LanguageServerUrl) -> Self {
        Self {
            document_selector: Vec::new(),
            initialization_options: None,
            workspace_folder: None,
            server_url,
            actions: Vec::new(),
            server_command_prefix: "terraform-ls.".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_document_selector(mut self, language_ids: Vec<String>) -> Self {
        self.document_selector = language_ids;
        self
    }

    pub fn with_initialization_options(mut self, options: impl Into<InitOptions>) -> Self {
        self.initialization_options = Some(options.into());
        self
    }

    pub fn with_lazy_initialization_options<F>(mut self, thunk: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.initialization_options = Some(InitOptions::Lazy(Arc::new(thunk)));
        self
    }

    pub fn with_workspace_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.workspace_folder = Some(folder.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<ActionBinding>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_server_command_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.server_command_prefix = prefix.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Convert a filesystem path to a `file://` URI
pub fn path_to_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}
