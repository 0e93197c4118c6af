//! Session lifecycle and connection management
//!
//! One logical session per bridge: acquire transport, negotiate,
//! run, stop. Capability contribution and consumption complete before
//! the state is ever observed as `Running`, so commands cannot race
//! ahead of capability availability. Transport close never auto-restarts
//! the session; reconnecting is the caller's decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::config::{path_to_uri, SessionConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::features::{CommandRegistry, FeatureRegistry};
use crate::host::BridgeEvent;
use crate::protocol::{
    error_codes, ClientCapabilities, ClientInfo, Diagnostic, ExecuteCommandParams,
    InitializeParams, InitializeResult, Message, Notification, Request, RequestId, Response,
    ResponseError, WorkspaceFolder,
};
use crate::transport::{self, BoxReader, BoxWriter};

type PendingRequest = oneshot::Sender<Response>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of the language client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// One live bridge session.
///
/// Owns the transport writer exclusively; the reader half runs in a
/// dedicated task owned by the connection manager.
pub struct Session {
    state: AtomicU8,
    writer: Mutex<Option<BoxWriter>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    commands: Mutex<CommandRegistry>,
    features: Mutex<FeatureRegistry>,
    capabilities: RwLock<Option<InitializeResult>>,
    diagnostics: RwLock<HashMap<String, Vec<Diagnostic>>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        writer: BoxWriter,
        features: FeatureRegistry,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        Self {
            state: AtomicU8::new(ClientState::Starting.to_u8()),
            writer: Mutex::new(Some(writer)),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            commands: Mutex::new(CommandRegistry::new()),
            features: Mutex::new(features),
            capabilities: RwLock::new(None),
            diagnostics: RwLock::new(HashMap::new()),
            events,
            request_timeout,
        }
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Move to `Stopped`; true if this call performed the transition.
    fn mark_stopped(&self) -> bool {
        self.state.swap(ClientState::Stopped.to_u8(), Ordering::AcqRel)
            != ClientState::Stopped.to_u8()
    }

    /// The negotiated capability set, available once `Running`
    pub async fn capabilities(&self) -> Option<InitializeResult> {
        self.capabilities.read().await.clone()
    }

    pub async fn get_diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .read()
            .await
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Execute a server-side analysis command and await its result.
    pub async fn execute_command(
        &self,
        command: &str,
        arguments: Vec<Value>,
    ) -> BridgeResult<Value> {
        if self.state() != ClientState::Running {
            return Err(BridgeError::NotConnected);
        }
        let params = ExecuteCommandParams {
            command: command.to_string(),
            arguments: if arguments.is_empty() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request("workspace/executeCommand", Some(serde_json::to_value(params)?))
            .await
    }

    /// Invoke a capability-gated client-side command by id.
    ///
    /// Used by the host UI (code lens clicks). Returns whether a
    /// handler was registered; an absent id is a no-op.
    pub async fn invoke_client_command(&self, id: &str, args: Vec<Value>) -> bool {
        let commands = self.commands.lock().await;
        commands.invoke(id, args).await
    }

    /// Send a request and wait for the response
    pub(crate) async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> BridgeResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(RequestId::Number(id), tx);
        }

        let request = Request::new(id, method, params);
        tracing::trace!("LSP request {}: {}", id, method);

        if let Err(e) = self.write(&Message::Request(request)).await {
            self.pending.lock().await.remove(&RequestId::Number(id));
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => match response.into_result() {
                Ok(result) => Ok(serde_json::from_value(result)?),
                Err(err) => Err(err.into()),
            },
            Ok(Err(_)) => Err(BridgeError::RequestCancelled),
            Err(_) => {
                self.cancel_request(id).await;
                Err(BridgeError::Timeout(format!(
                    "request '{}' timed out. The language server may be busy or unresponsive",
                    method
                )))
            }
        }
    }

    async fn cancel_request(&self, id: u64) {
        {
            let mut pending = self.pending.lock().await;
            pending.remove(&RequestId::Number(id));
        }
        let _ = self
            .notify("$/cancelRequest", Some(serde_json::json!({ "id": id })))
            .await;
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> BridgeResult<()> {
        let notification = Notification::new(method, params);
        self.write(&Message::Notification(notification)).await
    }

    async fn write(&self, message: &Message) -> BridgeResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        writer.write(message).await
    }

    /// Cancel all pending requests with an error response
    async fn cancel_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        if count > 0 {
            tracing::debug!("Cancelling {} pending requests: {}", count, reason);
            for (id, sender) in pending.drain() {
                let response = Response::failure(
                    id,
                    ResponseError {
                        code: error_codes::REQUEST_CANCELLED,
                        message: reason.to_string(),
                        data: None,
                    },
                );
                let _ = sender.send(response);
            }
        }
    }

    /// Handle one inbound message from the reader task
    async fn handle_message(&self, message: Message) {
        match message {
            Message::Response(response) => {
                if let Some(id) = response.id.clone() {
                    let sender = {
                        let mut pending = self.pending.lock().await;
                        // Direct match first, then string->number coercion
                        pending.remove(&id).or_else(|| {
                            if let RequestId::String(s) = &id {
                                s.parse::<u64>()
                                    .ok()
                                    .and_then(|n| pending.remove(&RequestId::Number(n)))
                            } else {
                                None
                            }
                        })
                    };
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => {
                            tracing::debug!(
                                "Response for unknown request ID {:?} (may have timed out)",
                                id
                            );
                        }
                    }
                }
            }
            Message::Request(request) => {
                self.handle_server_request(request).await;
            }
            Message::Notification(notification) => {
                self.handle_server_notification(notification).await;
            }
        }
    }

    async fn handle_server_request(&self, request: Request) {
        let result = match request.method.as_str() {
            "workspace/executeCommand" => {
                let (command, arguments) = request
                    .params
                    .as_ref()
                    .and_then(|p| {
                        serde_json::from_value::<ExecuteCommandParams>(p.clone()).ok()
                    })
                    .map(|p| (p.command, p.arguments.unwrap_or_default()))
                    .unwrap_or_default();
                let commands = self.commands.lock().await;
                commands.invoke(&command, arguments).await;
                Ok(Value::Null)
            }
            "client/registerCapability"
            | "client/unregisterCapability"
            | "window/workDoneProgress/create" => Ok(Value::Null),
            other => {
                tracing::debug!("Unhandled server request: {}", other);
                Err(ResponseError {
                    code: error_codes::METHOD_NOT_FOUND,
                    message: format!("Method not found: {}", other),
                    data: None,
                })
            }
        };

        let response = match result {
            Ok(value) => Response::success(request.id, value),
            Err(error) => Response::failure(request.id, error),
        };
        if let Err(e) = self.write(&Message::Response(response)).await {
            tracing::warn!("Failed to respond to server request: {}", e);
        }
    }

    async fn handle_server_notification(&self, notification: Notification) {
        let params = notification.params.unwrap_or(Value::Null);
        match notification.method.as_str() {
            "textDocument/publishDiagnostics" => {
                let uri = params.get("uri").and_then(|u| u.as_str());
                let diags = params.get("diagnostics").cloned();
                if let (Some(uri), Some(diags)) = (uri, diags) {
                    if let Ok(diagnostics) = serde_json::from_value::<Vec<Diagnostic>>(diags) {
                        tracing::debug!("{} diagnostics for {}", diagnostics.len(), uri);
                        self.diagnostics
                            .write()
                            .await
                            .insert(uri.to_string(), diagnostics.clone());
                        let _ = self.events.send(BridgeEvent::DiagnosticsPublished {
                            uri: uri.to_string(),
                            diagnostics,
                        });
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                if let Some(msg) = params.get("message").and_then(|m| m.as_str()) {
                    // LSP MessageType: 1=Error, 2=Warning, 3=Info, 4=Log
                    match params.get("type").and_then(|t| t.as_u64()) {
                        Some(1) => tracing::error!("LSP: {}", msg),
                        Some(2) => tracing::warn!("LSP: {}", msg),
                        Some(3) => tracing::info!("LSP: {}", msg),
                        _ => tracing::debug!("LSP: {}", msg),
                    }
                }
            }
            other => {
                tracing::trace!("Unhandled notification: {}", other);
            }
        }
    }
}

/// Owns the lifecycle of the one live session per bridge.
pub struct ConnectionManager {
    events: mpsc::UnboundedSender<BridgeEvent>,
    session: RwLock<Option<Arc<Session>>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<ClientState>>>,
    connect_gate: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager plus the event stream the host consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                session: RwLock::new(None),
                observers: Mutex::new(Vec::new()),
                connect_gate: Mutex::new(()),
            }),
            rx,
        )
    }

    /// Subscribe to state transitions: a lazy, unbounded,
    /// non-restartable sequence.
    pub async fn state_changes(&self) -> mpsc::UnboundedReceiver<ClientState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().await.push(tx);
        rx
    }

    async fn publish_state(&self, state: ClientState) {
        tracing::debug!("Client state -> {}", state);
        {
            let mut observers = self.observers.lock().await;
            observers.retain(|tx| tx.send(state).is_ok());
        }
        let _ = self.events.send(BridgeEvent::StateChanged(state));
    }

    pub async fn state(&self) -> ClientState {
        match self.session.read().await.as_ref() {
            Some(session) => session.state(),
            None => ClientState::Stopped,
        }
    }

    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    /// The running session, or `NotConnected`.
    pub async fn require_running(&self) -> BridgeResult<Arc<Session>> {
        match self.session.read().await.as_ref() {
            Some(session) if session.state() == ClientState::Running => Ok(Arc::clone(session)),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Connect to the configured language server over WebSocket.
    ///
    /// Resolves with a live session once negotiation completes. Fails
    /// with `Connect` if the transport dies before negotiation, or
    /// `Protocol` if the server rejects initialization. Not
    /// cancellable: tear down the resolved session instead.
    pub async fn connect(
        self: &Arc<Self>,
        config: SessionConfig,
        features: FeatureRegistry,
    ) -> BridgeResult<Arc<Session>> {
        let _gate = self.connect_gate.lock().await;
        self.ensure_stopped().await?;
        let (reader, writer) = transport::connect_websocket(&config.server_url).await?;
        self.start_session(config, features, Box::new(reader), Box::new(writer))
            .await
    }

    /// Connect over a caller-supplied transport (tests, embedding).
    pub async fn connect_with_transport(
        self: &Arc<Self>,
        config: SessionConfig,
        features: FeatureRegistry,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> BridgeResult<Arc<Session>> {
        let _gate = self.connect_gate.lock().await;
        self.ensure_stopped().await?;
        self.start_session(config, features, reader, writer).await
    }

    /// At most one live session: refuse while one is starting/running.
    async fn ensure_stopped(&self) -> BridgeResult<()> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.state() != ClientState::Stopped {
                return Err(BridgeError::Connect(
                    "a session is already starting or running".to_string(),
                ));
            }
        }
        Ok(())
    }

    // Caller must hold the connect gate.
    async fn start_session(
        self: &Arc<Self>,
        config: SessionConfig,
        features: FeatureRegistry,
        reader: BoxReader,
        writer: BoxWriter,
    ) -> BridgeResult<Arc<Session>> {
        self.publish_state(ClientState::Starting).await;

        let mut capabilities = base_client_capabilities();
        features.contribute(&mut capabilities);

        let session = Arc::new(Session::new(
            writer,
            features,
            config.request_timeout,
            self.events.clone(),
        ));
        *self.session.write().await = Some(Arc::clone(&session));

        let manager = Arc::clone(self);
        let reader_session = Arc::clone(&session);
        tokio::spawn(async move {
            manager.run_reader(reader_session, reader).await;
        });

        match self.negotiate(&session, &config, capabilities).await {
            Ok(()) => {
                session.set_state(ClientState::Running);
                self.publish_state(ClientState::Running).await;
                tracing::info!("Language client running against {}", config.server_url);
                Ok(session)
            }
            Err(e) => {
                tracing::error!("Negotiation failed: {}", e);
                self.finish_session(&session, None).await;
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        session: &Arc<Session>,
        config: &SessionConfig,
        capabilities: ClientCapabilities,
    ) -> BridgeResult<()> {
        let workspace_folders = config.workspace_folder.as_deref().map(|folder| {
            vec![WorkspaceFolder {
                uri: path_to_uri(folder),
                name: "Workspace".to_string(),
            }]
        });
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: config.workspace_folder.as_deref().map(path_to_uri),
            capabilities,
            client_info: Some(ClientInfo {
                name: "langbridge".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            initialization_options: config
                .initialization_options
                .as_ref()
                .map(|options| options.resolve()),
            workspace_folders,
        };

        let result: InitializeResult = session
            .request("initialize", Some(serde_json::to_value(params)?))
            .await
            .map_err(|e| match e {
                // Transport died before negotiation completed
                BridgeError::Transport(m) => BridgeError::Connect(m),
                BridgeError::NotConnected => {
                    BridgeError::Connect("transport closed before negotiation".to_string())
                }
                other => other,
            })?;

        {
            let mut commands = session.commands.lock().await;
            let mut features = session.features.lock().await;
            features.consume(&result.capabilities, &mut commands).await;
        }
        *session.capabilities.write().await = Some(result);

        session
            .notify("initialized", Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    async fn run_reader(self: Arc<Self>, session: Arc<Session>, mut reader: BoxReader) {
        let error = loop {
            match reader.read().await {
                Ok(Some(message)) => session.handle_message(message).await,
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };
        self.finish_session(&session, error).await;
    }

    /// Terminal cleanup; runs at most once per session.
    async fn finish_session(&self, session: &Arc<Session>, error: Option<String>) {
        if !session.mark_stopped() {
            return;
        }
        session.cancel_pending("connection closed").await;
        {
            let mut commands = session.commands.lock().await;
            let mut features = session.features.lock().await;
            features.dispose(&mut commands);
        }
        if let Some(mut writer) = session.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.publish_state(ClientState::Stopped).await;
        if let Some(cause) = error {
            tracing::error!("Session ended with error: {}", cause);
            let _ = self.events.send(BridgeEvent::Error(cause));
        }
        let _ = self.events.send(BridgeEvent::Closed);
    }

    /// Dispose features, request protocol shutdown, close the
    /// transport. Idempotent: a no-op on an already-stopped session.
    pub async fn teardown(&self) -> BridgeResult<()> {
        let session = self.session.read().await.clone();
        let Some(session) = session else {
            return Ok(());
        };
        if session.state() == ClientState::Stopped {
            return Ok(());
        }

        tracing::info!("Tearing down language client session");
        {
            let mut commands = session.commands.lock().await;
            let mut features = session.features.lock().await;
            features.dispose(&mut commands);
        }

        // Staged shutdown: polite request, then exit, then close
        if timeout(SHUTDOWN_GRACE, session.request::<Value>("shutdown", None))
            .await
            .is_err()
        {
            tracing::debug!("Shutdown request timed out");
        }
        let _ = session.notify("exit", None).await;

        self.finish_session(&session, None).await;
        Ok(())
    }
}

fn base_client_capabilities() -> ClientCapabilities {
    let mut caps = ClientCapabilities::default();
    caps.workspace_mut().execute_command = Some(serde_json::json!({
        "dynamicRegistration": false
    }));
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LanguageServerUrl;
    use crate::test_support::{drain_states, FakeServer, FakeServerConfig};
    use tokio_test::assert_ok;

    fn test_config() -> SessionConfig {
        SessionConfig::new(LanguageServerUrl::new("localhost", 3001).insecure())
            .with_document_selector(vec!["terraform".to_string()])
            .with_request_timeout(Duration::from_secs(5))
    }

    async fn connect(
        manager: &Arc<ConnectionManager>,
        server_config: FakeServerConfig,
    ) -> (FakeServer, Arc<Session>) {
        let (server, reader, writer) = FakeServer::spawn(server_config);
        let session = manager
            .connect_with_transport(test_config(), FeatureRegistry::new(), reader, writer)
            .await
            .expect("connect failed");
        (server, session)
    }

    #[tokio::test]
    async fn test_connect_reaches_running_exactly_once() {
        let (manager, _events) = ConnectionManager::new();
        let mut states = manager.state_changes().await;

        let (server, session) = connect(&manager, FakeServerConfig::default()).await;
        assert_eq!(session.state(), ClientState::Running);

        let seen = drain_states(&mut states);
        assert_eq!(seen, vec![ClientState::Starting, ClientState::Running]);

        // Negotiation handshake: initialize request, initialized notification
        assert_eq!(server.request_methods().await, vec!["initialize"]);
        assert_eq!(server.notification_methods().await, vec!["initialized"]);
    }

    #[tokio::test]
    async fn test_initialize_carries_workspace_folder_and_options() {
        let (manager, _events) = ConnectionManager::new();
        let (server, reader, writer) = FakeServer::spawn(FakeServerConfig::default());

        let config = test_config()
            .with_workspace_folder("/workspace/project")
            .with_initialization_options(serde_json::json!({"indexing": true}));
        manager
            .connect_with_transport(config, FeatureRegistry::new(), reader, writer)
            .await
            .unwrap();

        let init = server.requests().await[0].clone();
        let params = init.params.unwrap();
        assert_eq!(
            params["workspaceFolders"][0]["uri"],
            "file:///workspace/project"
        );
        assert_eq!(params["rootUri"], "file:///workspace/project");
        assert_eq!(params["initializationOptions"]["indexing"], true);
        assert_eq!(params["clientInfo"]["name"], "langbridge");
    }

    #[tokio::test]
    async fn test_rejected_initialize_is_protocol_error_and_stops() {
        let (manager, _events) = ConnectionManager::new();
        let mut states = manager.state_changes().await;

        let (_server, reader, writer) = FakeServer::spawn(FakeServerConfig {
            reject_initialize: Some(ResponseError {
                code: error_codes::INVALID_PARAMS,
                message: "unsupported client".to_string(),
                data: None,
            }),
            ..Default::default()
        });
        let err = manager
            .connect_with_transport(test_config(), FeatureRegistry::new(), reader, writer)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { code, .. } if code == error_codes::INVALID_PARAMS));

        let seen = drain_states(&mut states);
        assert_eq!(seen, vec![ClientState::Starting, ClientState::Stopped]);
        assert_eq!(manager.state().await, ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_second_connect_while_running_is_refused() {
        let (manager, _events) = ConnectionManager::new();
        let (_server, _session) = connect(&manager, FakeServerConfig::default()).await;

        let (_other, reader, writer) = FakeServer::spawn(FakeServerConfig::default());
        let err = manager
            .connect_with_transport(test_config(), FeatureRegistry::new(), reader, writer)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connect(_)));
    }

    #[tokio::test]
    async fn test_reconnect_after_teardown_is_allowed() {
        let (manager, _events) = ConnectionManager::new();
        let (_server, _session) = connect(&manager, FakeServerConfig::default()).await;

        manager.teardown().await.unwrap();
        assert_eq!(manager.state().await, ClientState::Stopped);

        let (_other, session) = connect(&manager, FakeServerConfig::default()).await;
        assert_eq!(session.state(), ClientState::Running);
    }

    #[tokio::test]
    async fn test_transport_close_while_running_stops_session() {
        let (manager, mut events) = ConnectionManager::new();
        let mut states = manager.state_changes().await;

        let (server, session) = connect(&manager, FakeServerConfig::default()).await;
        server.close().await;

        // Reader task observes the close and finishes the session
        let mut saw_closed = false;
        while let Some(event) = events.recv().await {
            if matches!(event, BridgeEvent::Closed) {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
        assert_eq!(session.state(), ClientState::Stopped);

        let seen = drain_states(&mut states);
        assert_eq!(
            seen,
            vec![ClientState::Starting, ClientState::Running, ClientState::Stopped]
        );

        // No auto-restart: the session stays down
        assert!(manager.require_running().await.is_err());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (manager, _events) = ConnectionManager::new();
        let (server, _session) = connect(&manager, FakeServerConfig::default()).await;

        manager.teardown().await.unwrap();
        manager.teardown().await.unwrap();
        manager.teardown().await.unwrap();

        // Exactly one shutdown/exit pair reached the server
        let methods = server.request_methods().await;
        assert_eq!(
            methods.iter().filter(|m| m.as_str() == "shutdown").count(),
            1
        );
        let notifications = server.notification_methods().await;
        assert_eq!(
            notifications.iter().filter(|m| m.as_str() == "exit").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_teardown_without_session_is_noop() {
        let (manager, _events) = ConnectionManager::new();
        tokio_test::assert_ok!(manager.teardown().await);
        assert_eq!(manager.state().await, ClientState::Stopped);
    }

    #[tokio::test]
    async fn test_execute_command_round_trip() {
        let (manager, _events) = ConnectionManager::new();
        let mut server_config = FakeServerConfig::default();
        server_config.command_results.insert(
            "terraform-ls.module.providers".to_string(),
            serde_json::json!({"installed_providers": {"registry.terraform.io/hashicorp/aws": "5.0.0"}}),
        );
        let (server, session) = connect(&manager, server_config).await;

        let result = session
            .execute_command(
                "terraform-ls.module.providers",
                vec![serde_json::json!("uri=file:///workspace")],
            )
            .await
            .unwrap();
        assert!(result["installed_providers"].is_object());

        let executed = server.executed_commands().await;
        assert_eq!(executed, vec!["terraform-ls.module.providers"]);
    }

    #[tokio::test]
    async fn test_execute_command_before_running_fails() {
        let (manager, _events) = ConnectionManager::new();
        assert!(matches!(
            manager.require_running().await,
            Err(BridgeError::NotConnected)
        ));

        // After a close, the held session handle also refuses
        let (server, session) = connect(&manager, FakeServerConfig::default()).await;
        server.close().await;
        while session.state() != ClientState::Stopped {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            session.execute_command("terraform-ls.format", vec![]).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_server_invoked_client_command_dispatches() {
        let (manager, _events) = ConnectionManager::new();
        let (server, session) = connect(&manager, FakeServerConfig::default()).await;

        // Server sends workspace/executeCommand for an unknown client
        // command: bridge replies with a null result, not an error.
        server
            .send(Message::Request(Request::new(
                99,
                "workspace/executeCommand",
                Some(serde_json::json!({"command": "client.showReferences", "arguments": []})),
            )))
            .await;

        let response = server.wait_for_response(RequestId::Number(99)).await;
        assert!(response.is_success());
        drop(session);
    }

    #[tokio::test]
    async fn test_unknown_server_request_gets_method_not_found() {
        let (manager, _events) = ConnectionManager::new();
        let (server, _session) = connect(&manager, FakeServerConfig::default()).await;

        server
            .send(Message::Request(Request::new(
                7,
                "workspace/applyEdit",
                None,
            )))
            .await;

        let response = server.wait_for_response(RequestId::Number(7)).await;
        assert_eq!(
            response.error.map(|e| e.code),
            Some(error_codes::METHOD_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn test_publish_diagnostics_cached_and_surfaced() {
        let (manager, mut events) = ConnectionManager::new();
        let (server, session) = connect(&manager, FakeServerConfig::default()).await;

        server
            .send(Message::Notification(Notification::new(
                "textDocument/publishDiagnostics",
                Some(serde_json::json!({
                    "uri": "file:///main.tf",
                    "diagnostics": [{
                        "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 4}},
                        "severity": 1,
                        "message": "Unsupported block type"
                    }]
                })),
            )))
            .await;

        let mut published = None;
        while let Some(event) = events.recv().await {
            if let BridgeEvent::DiagnosticsPublished { uri, diagnostics } = event {
                published = Some((uri, diagnostics));
                break;
            }
        }
        let (uri, diagnostics) = published.unwrap();
        assert_eq!(uri, "file:///main.tf");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "Unsupported block type");

        let cached = session.get_diagnostics("file:///main.tf").await;
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn test_features_disposed_once_across_close_and_teardown() {
        use std::sync::atomic::AtomicUsize;

        use async_trait::async_trait;

        use crate::features::Feature;

        struct CountingFeature {
            disposals: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Feature for CountingFeature {
            fn name(&self) -> &'static str {
                "counting"
            }

            fn fill_client_capabilities(&self, _capabilities: &mut ClientCapabilities) {}

            async fn initialize(
                &mut self,
                _capabilities: &crate::protocol::ServerCapabilities,
                _commands: &mut CommandRegistry,
            ) -> BridgeResult<()> {
                Ok(())
            }

            fn dispose(&mut self, _commands: &mut CommandRegistry) {
                self.disposals.fetch_add(1, Ordering::SeqCst);
            }
        }

        let disposals = Arc::new(AtomicUsize::new(0));
        let mut features = FeatureRegistry::new();
        features.register(Box::new(CountingFeature {
            disposals: Arc::clone(&disposals),
        }));

        let (manager, _events) = ConnectionManager::new();
        let (server, reader, writer) = FakeServer::spawn(FakeServerConfig::default());
        let session = manager
            .connect_with_transport(test_config(), features, reader, writer)
            .await
            .unwrap();

        // Error-triggered teardown, then an explicit one on top
        server.close().await;
        while session.state() != ClientState::Stopped {
            tokio::task::yield_now().await;
        }
        manager.teardown().await.unwrap();

        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    mod reference_feature {
        use super::*;
        use std::sync::Mutex as StdMutex;

        use async_trait::async_trait;
        use tokio_util::sync::CancellationToken;

        use crate::features::{ShowReferencesFeature, SHOW_REFERENCES_COMMAND_ID};
        use crate::host::{EditorHost, ReferenceProvider};
        use crate::protocol::{Location, Position, Range, ReferenceContext};

        #[derive(Default)]
        struct TestHost {
            shown: StdMutex<Vec<(String, usize)>>,
        }

        #[async_trait]
        impl EditorHost for TestHost {
            async fn active_document(&self) -> Option<String> {
                Some("file:///main.tf".to_string())
            }

            async fn show_references(
                &self,
                uri: &str,
                _position: Position,
                locations: Vec<Location>,
            ) {
                self.shown
                    .lock()
                    .unwrap()
                    .push((uri.to_string(), locations.len()));
            }

            async fn refresh(&self) {}
        }

        struct TestProvider;

        #[async_trait]
        impl ReferenceProvider for TestProvider {
            async fn references(
                &self,
                uri: &str,
                position: Position,
                _context: &ReferenceContext,
                _token: CancellationToken,
            ) -> BridgeResult<Vec<Location>> {
                Ok(vec![Location {
                    uri: uri.to_string(),
                    range: Range::point(position),
                }])
            }
        }

        fn lens_args() -> Value {
            serde_json::json!({
                "command": SHOW_REFERENCES_COMMAND_ID,
                "arguments": [
                    {"line": 3, "character": 7},
                    {"includeDeclaration": true}
                ]
            })
        }

        #[tokio::test]
        async fn test_code_lens_click_round_trip() {
            let (manager, _events) = ConnectionManager::new();
            let host = Arc::new(TestHost::default());
            let mut features = FeatureRegistry::new();
            features.register(Box::new(ShowReferencesFeature::new(
                Arc::clone(&host) as Arc<dyn EditorHost>,
                Arc::new(TestProvider),
            )));

            let (server, reader, writer) =
                FakeServer::spawn(FakeServerConfig::with_reference_count_code_lens());
            manager
                .connect_with_transport(test_config(), features, reader, writer)
                .await
                .unwrap();

            // The declared command id reached the server during negotiation
            let init = server.requests().await[0].clone();
            assert_eq!(
                init.params.unwrap()["capabilities"]["experimental"]["showReferencesCommandId"],
                SHOW_REFERENCES_COMMAND_ID
            );

            // Server-side code lens click arrives as executeCommand
            server
                .send(Message::Request(Request::new(
                    42,
                    "workspace/executeCommand",
                    Some(lens_args()),
                )))
                .await;
            let response = server.wait_for_response(RequestId::Number(42)).await;
            assert!(response.is_success());

            let shown = host.shown.lock().unwrap().clone();
            assert_eq!(shown, vec![("file:///main.tf".to_string(), 1)]);
        }

        #[tokio::test]
        async fn test_missing_code_lens_capability_disables_command() {
            let (manager, _events) = ConnectionManager::new();
            let host = Arc::new(TestHost::default());
            let mut features = FeatureRegistry::new();
            features.register(Box::new(ShowReferencesFeature::new(
                Arc::clone(&host) as Arc<dyn EditorHost>,
                Arc::new(TestProvider),
            )));

            // Server never declares referenceCountCodeLens
            let (server, reader, writer) = FakeServer::spawn(FakeServerConfig::default());
            manager
                .connect_with_transport(test_config(), features, reader, writer)
                .await
                .unwrap();

            server
                .send(Message::Request(Request::new(
                    43,
                    "workspace/executeCommand",
                    Some(lens_args()),
                )))
                .await;
            // Unregistered command: reply is still a benign null result
            let response = server.wait_for_response(RequestId::Number(43)).await;
            assert!(response.is_success());
            assert!(host.shown.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_state_display() {
        assert_eq!(ClientState::Stopped.to_string(), "Stopped");
        assert_eq!(ClientState::Starting.to_string(), "Starting");
        assert_eq!(ClientState::Running.to_string(), "Running");
    }
}
