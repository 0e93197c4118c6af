//! Scripted in-process language server for exercising sessions
//! end-to-end over the in-memory transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::{
    error_codes, ExecuteCommandParams, InitializeResult, Message, Notification, Request,
    RequestId, Response, ResponseError, ServerCapabilities, ServerInfo,
};
use crate::session::ClientState;
use crate::transport::{memory_pair, BoxReader, BoxWriter, MemoryWriter, MessageReader};

/// Behavior knobs for a [`FakeServer`].
#[derive(Default)]
pub(crate) struct FakeServerConfig {
    pub capabilities: ServerCapabilities,
    pub reject_initialize: Option<ResponseError>,
    pub command_results: HashMap<String, Value>,
    pub command_errors: HashMap<String, ResponseError>,
}

impl FakeServerConfig {
    pub fn with_reference_count_code_lens() -> Self {
        Self {
            capabilities: ServerCapabilities {
                experimental: Some(crate::protocol::ExperimentalServerCapabilities {
                    reference_count_code_lens: Some(true),
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// A language server stand-in running on the peer end of a memory pair.
///
/// Answers initialize, shutdown, and workspace/executeCommand; records
/// everything it receives for assertions.
pub(crate) struct FakeServer {
    requests: Arc<StdMutex<Vec<Request>>>,
    notifications: Arc<StdMutex<Vec<Notification>>>,
    responses: Arc<StdMutex<Vec<Response>>>,
    writer: Arc<Mutex<Option<MemoryWriter>>>,
}

impl FakeServer {
    /// Start the server task; returns the client-side transport halves.
    pub fn spawn(config: FakeServerConfig) -> (Self, BoxReader, BoxWriter) {
        init_tracing();
        let (client_end, server_end) = memory_pair();
        let mut reader = server_end.reader;
        let writer = Arc::new(Mutex::new(Some(server_end.writer)));

        let requests = Arc::new(StdMutex::new(Vec::new()));
        let notifications = Arc::new(StdMutex::new(Vec::new()));
        let responses = Arc::new(StdMutex::new(Vec::new()));

        let task_requests = Arc::clone(&requests);
        let task_notifications = Arc::clone(&notifications);
        let task_responses = Arc::clone(&responses);
        let task_writer = Arc::clone(&writer);

        tokio::spawn(async move {
            loop {
                match reader.read().await {
                    Ok(Some(Message::Request(request))) => {
                        task_requests.lock().unwrap().push(request.clone());
                        let response = script_response(&config, request);
                        let mut guard = task_writer.lock().await;
                        if let Some(writer) = guard.as_mut() {
                            use crate::transport::MessageWriter;
                            let _ = writer.write(&Message::Response(response)).await;
                        }
                    }
                    Ok(Some(Message::Notification(notification))) => {
                        task_notifications.lock().unwrap().push(notification);
                    }
                    Ok(Some(Message::Response(response))) => {
                        task_responses.lock().unwrap().push(response);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        (
            Self {
                requests,
                notifications,
                responses,
                writer,
            },
            Box::new(client_end.reader),
            Box::new(client_end.writer),
        )
    }

    /// Let in-flight deliveries settle before inspecting recordings.
    async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    pub async fn requests(&self) -> Vec<Request> {
        self.settle().await;
        self.requests.lock().unwrap().clone()
    }

    pub async fn request_methods(&self) -> Vec<String> {
        self.requests()
            .await
            .into_iter()
            .map(|r| r.method)
            .collect()
    }

    pub async fn notification_methods(&self) -> Vec<String> {
        self.settle().await;
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.method.clone())
            .collect()
    }

    /// Command names from recorded workspace/executeCommand requests
    pub async fn executed_commands(&self) -> Vec<String> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.method == "workspace/executeCommand")
            .filter_map(|r| {
                r.params
                    .and_then(|p| serde_json::from_value::<ExecuteCommandParams>(p).ok())
                    .map(|p| p.command)
            })
            .collect()
    }

    /// Inject a server-initiated message toward the client.
    pub async fn send(&self, message: Message) {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            use crate::transport::MessageWriter;
            writer.write(&message).await.expect("fake server write");
        }
    }

    /// Block until the client answers a server-initiated request.
    pub async fn wait_for_response(&self, id: RequestId) -> Response {
        loop {
            {
                let responses = self.responses.lock().unwrap();
                if let Some(response) = responses.iter().find(|r| r.id.as_ref() == Some(&id)) {
                    return response.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Drop the server's writer: the client observes an orderly close.
    pub async fn close(&self) {
        self.writer.lock().await.take();
    }
}

fn script_response(config: &FakeServerConfig, request: Request) -> Response {
    match request.method.as_str() {
        "initialize" => match &config.reject_initialize {
            Some(error) => Response::failure(request.id, error.clone()),
            None => {
                let result = InitializeResult {
                    capabilities: config.capabilities.clone(),
                    server_info: Some(ServerInfo {
                        name: "fake-ls".to_string(),
                        version: Some("0.0.1".to_string()),
                    }),
                };
                Response::success(request.id, serde_json::to_value(result).unwrap())
            }
        },
        "shutdown" => Response::success(request.id, Value::Null),
        "workspace/executeCommand" => {
            let command = request
                .params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(|c| c.as_str())
                .unwrap_or("");
            if let Some(error) = config.command_errors.get(command) {
                return Response::failure(request.id, error.clone());
            }
            let result = config.command_results.get(command).cloned().unwrap_or(Value::Null);
            Response::success(request.id, result)
        }
        other => Response::failure(
            request.id,
            ResponseError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("Method not found: {}", other),
                data: None,
            },
        ),
    }
}

/// Log capture honoring `RUST_LOG`; safe to call from every test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Collect every state transition already delivered to an observer.
pub(crate) fn drain_states(rx: &mut mpsc::UnboundedReceiver<ClientState>) -> Vec<ClientState> {
    let mut states = Vec::new();
    while let Ok(state) = rx.try_recv() {
        states.push(state);
    }
    states
}
