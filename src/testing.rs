//! Testing utilities
//!
//! An in-memory duplex transport pair and a scriptable fake language
//! server for exercising the engine without real server processes.

use crate::io::framing::FrameCodec;
use crate::io::process::{LaunchError, Launcher, ServerHandle};
use crate::io::transport::Transport;
use crate::jsonrpc::{self, Message};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

// ============================================================================
// Pipe Transport
// ============================================================================

/// Error type for the in-memory pipe transport
#[derive(Debug, thiserror::Error)]
pub enum PipeTransportError {
    #[error("pipe is disconnected")]
    Disconnected,
}

/// One end of an in-memory duplex byte pipe
pub struct PipeTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: bool,
}

/// Create a connected transport pair; bytes sent on one end are
/// received on the other
pub fn transport_pair() -> (PipeTransport, PipeTransport) {
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();

    (
        PipeTransport {
            tx: Some(tx_ab),
            rx: rx_ba,
            connected: true,
        },
        PipeTransport {
            tx: Some(tx_ba),
            rx: rx_ab,
            connected: true,
        },
    )
}

#[async_trait]
impl Transport for PipeTransport {
    type Error = PipeTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(PipeTransportError::Disconnected);
        }
        self.tx
            .as_ref()
            .ok_or(PipeTransportError::Disconnected)?
            .send(message.as_bytes().to_vec())
            .map_err(|_| PipeTransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(PipeTransportError::Disconnected);
        }
        self.rx.recv().await.ok_or(PipeTransportError::Disconnected)
    }

    async fn shutdown_write(&mut self) -> Result<(), Self::Error> {
        self.tx.take();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.tx.take();
        self.rx.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.tx.is_some()
    }
}

// ============================================================================
// Fake Server
// ============================================================================

/// How the fake server answers requests for a method
#[derive(Debug, Clone)]
enum ReplyRule {
    Result(Value),
    Error { code: i32, message: String },
    /// Record the request but do not answer until the test calls
    /// [`FakeServer::respond`]
    Hold,
}

/// Server-side actions injected by the test
enum ServerCommand {
    Respond { id: Value, result: Value },
    RespondError { id: Value, code: i32, message: String },
    Notify { method: String, params: Value },
    Request { id: Value, method: String, params: Value },
}

/// Configures and spawns a [`FakeServer`]
pub struct FakeServerBuilder {
    initialize_result: Value,
    rules: HashMap<String, ReplyRule>,
}

impl Default for FakeServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServerBuilder {
    pub fn new() -> Self {
        Self {
            initialize_result: json!({ "capabilities": {} }),
            rules: HashMap::new(),
        }
    }

    /// Set the `capabilities` member of the `initialize` result
    pub fn capabilities(mut self, capabilities: Value) -> Self {
        self.initialize_result = json!({ "capabilities": capabilities });
        self
    }

    /// Set the complete `initialize` result
    pub fn initialize_result(mut self, result: Value) -> Self {
        self.initialize_result = result;
        self
    }

    /// Answer every request for a method with a fixed result
    pub fn reply(mut self, method: &str, result: Value) -> Self {
        self.rules
            .insert(method.to_string(), ReplyRule::Result(result));
        self
    }

    /// Answer every request for a method with a fixed error
    pub fn reply_error(mut self, method: &str, code: i32, message: &str) -> Self {
        self.rules.insert(
            method.to_string(),
            ReplyRule::Error {
                code,
                message: message.to_string(),
            },
        );
        self
    }

    /// Record requests for a method without answering; the test replies
    /// later with [`FakeServer::respond`]
    pub fn hold(mut self, method: &str) -> Self {
        self.rules.insert(method.to_string(), ReplyRule::Hold);
        self
    }

    /// Spawn the server task; returns the handle and the client-side
    /// transport to hand to the engine
    pub fn spawn(self) -> (FakeServer, PipeTransport) {
        let (client_end, server_end) = transport_pair();
        let log = Arc::new(Mutex::new(Vec::new()));
        let changed = Arc::new(Notify::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_server(
            FrameCodec::new(server_end),
            self.initialize_result,
            self.rules,
            Arc::clone(&log),
            Arc::clone(&changed),
            control_rx,
        ));

        (
            FakeServer {
                log,
                changed,
                control: control_tx,
            },
            client_end,
        )
    }
}

/// Handle to a running scripted server
pub struct FakeServer {
    log: Arc<Mutex<Vec<Message>>>,
    changed: Arc<Notify>,
    control: mpsc::UnboundedSender<ServerCommand>,
}

impl FakeServer {
    /// Every message received so far, in arrival order
    pub fn messages(&self) -> Vec<Message> {
        self.log.lock().unwrap().clone()
    }

    /// Methods of received requests and notifications, in wire order
    pub fn wire_methods(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    /// `(id, params)` of every received request for a method
    pub fn requests_for(&self, method: &str) -> Vec<(Value, Option<Value>)> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request {
                    id,
                    method: m,
                    params,
                } if m == method => Some((id, params)),
                _ => None,
            })
            .collect()
    }

    /// Params of every received notification for a method
    pub fn notifications_for(&self, method: &str) -> Vec<Option<Value>> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Message::Notification { method: m, params } if m == method => Some(params),
                _ => None,
            })
            .collect()
    }

    /// Await a predicate over the message log
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&[Message]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.log.lock().unwrap()) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let step = deadline.min(now + Duration::from_millis(20));
            let _ = tokio::time::timeout_at(step, self.changed.notified()).await;
        }
    }

    /// Await the arrival of `count` requests for a method
    pub async fn wait_for_requests(&self, method: &str, count: usize, timeout: Duration) -> bool {
        let method = method.to_string();
        self.wait_until(
            move |messages| {
                messages
                    .iter()
                    .filter(|m| {
                        matches!(m, Message::Request { method: m, .. } if *m == method)
                    })
                    .count()
                    >= count
            },
            timeout,
        )
        .await
    }

    /// Answer a held request
    pub fn respond(&self, id: Value, result: Value) {
        let _ = self.control.send(ServerCommand::Respond { id, result });
    }

    /// Answer a held request with an error
    pub fn respond_error(&self, id: Value, code: i32, message: &str) {
        let _ = self.control.send(ServerCommand::RespondError {
            id,
            code,
            message: message.to_string(),
        });
    }

    /// Send a server-initiated notification
    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.control.send(ServerCommand::Notify {
            method: method.to_string(),
            params,
        });
    }

    /// Send a server-initiated request
    pub fn request(&self, id: Value, method: &str, params: Value) {
        let _ = self.control.send(ServerCommand::Request {
            id,
            method: method.to_string(),
            params,
        });
    }
}

async fn run_server(
    mut framed: FrameCodec<PipeTransport>,
    initialize_result: Value,
    rules: HashMap<String, ReplyRule>,
    log: Arc<Mutex<Vec<Message>>>,
    changed: Arc<Notify>,
    mut control_rx: mpsc::UnboundedReceiver<ServerCommand>,
) {
    enum Step {
        Send(String),
        Inbound(String),
        Stop,
    }

    loop {
        let step = tokio::select! {
            command = control_rx.recv() => match command {
                None => Step::Stop,
                Some(command) => Step::Send(command_frame(command)),
            },
            inbound = framed.receive() => match inbound {
                Ok(body) => Step::Inbound(body),
                Err(_) => {
                    debug!("fake server: client closed the stream");
                    Step::Stop
                }
            },
        };

        match step {
            Step::Stop => break,
            Step::Send(frame) => {
                if framed.send(&frame).await.is_err() {
                    break;
                }
            }
            Step::Inbound(body) => {
                let Ok(message) = jsonrpc::classify(&body) else {
                    continue;
                };

                log.lock().unwrap().push(message.clone());
                changed.notify_waiters();

                match message {
                    Message::Request { id, method, .. } => {
                        let reply = match rules.get(&method) {
                            Some(ReplyRule::Hold) => None,
                            Some(ReplyRule::Result(result)) => Some(
                                json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string(),
                            ),
                            Some(ReplyRule::Error { code, message }) => Some(
                                json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "error": { "code": code, "message": message }
                                })
                                .to_string(),
                            ),
                            None if method == "initialize" => Some(
                                json!({ "jsonrpc": "2.0", "id": id, "result": initialize_result })
                                    .to_string(),
                            ),
                            None => Some(
                                json!({ "jsonrpc": "2.0", "id": id, "result": null }).to_string(),
                            ),
                        };
                        if let Some(frame) = reply {
                            if framed.send(&frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Notification { ref method, .. } if method == "exit" => {
                        debug!("fake server: exiting on request");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    // Dropping the framed transport closes the stream towards the client
}

fn command_frame(command: ServerCommand) -> String {
    match command {
        ServerCommand::Respond { id, result } => {
            json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
        }
        ServerCommand::RespondError { id, code, message } => {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            })
            .to_string()
        }
        ServerCommand::Notify { method, params } => {
            jsonrpc::notification(&method, Some(params)).to_string()
        }
        ServerCommand::Request { id, method, params } => {
            json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
        }
    }
}

// ============================================================================
// Static Launcher
// ============================================================================

/// Launcher handing out pre-connected transports, one per pool slot
pub struct StaticLauncher {
    transports: Mutex<VecDeque<PipeTransport>>,
}

impl StaticLauncher {
    pub fn new(transports: Vec<PipeTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into()),
        }
    }
}

#[async_trait]
impl Launcher for StaticLauncher {
    type Transport = PipeTransport;
    type Handle = NoopHandle;

    async fn launch(&self) -> Result<(Self::Transport, Self::Handle), LaunchError> {
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .map(|transport| (transport, NoopHandle))
            .ok_or_else(|| LaunchError::Unavailable("no transports left".to_string()))
    }
}

/// Handle for servers that have no process to kill
pub struct NoopHandle;

#[async_trait]
impl ServerHandle for NoopHandle {
    async fn kill(&mut self) -> Result<(), LaunchError> {
        Ok(())
    }

    fn start_kill(&mut self) {}
}
