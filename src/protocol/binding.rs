//! Server binding
//!
//! One binding per connected language server: a bounded write queue, a
//! coordinator task that owns the framed transport, a pending table for
//! response correlation, and the document-sync state for files opened on
//! this server.
//!
//! The coordinator is a pure producer on the read side: inbound responses
//! complete the pending table directly (cheap, no handler code), while
//! server-initiated traffic is queued to the dispatch worker. Writes
//! drain the bounded queue in submission order, so client notifications
//! reach the wire in the order of their send calls.

use crate::io::framing::FrameCodec;
use crate::io::transport::Transport;
use crate::jsonrpc::{self, Message, RequestId};
use crate::protocol::dispatch::{InboundWork, spawn_dispatch_worker};
use crate::protocol::pending::{PendingTable, RawOutcome, RequestError};
use crate::protocol::registry::SealedRegistry;
use crate::session::documents::{DocumentStore, PreparedDocument};
use lsp_types::ServerCapabilities;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{Level, debug, error, warn};
use url::Url;

/// Lifecycle state of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    New,
    Initializing,
    Ready,
    Draining,
    Down,
}

/// How to behave when the in-flight window is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// Await the next completion (default)
    #[default]
    Wait,
    /// Fail immediately with a saturation error
    NoWait,
}

/// Job on the write queue
#[derive(Debug)]
pub enum WriteJob {
    Frame(String),
    /// Flush remaining frames, half-close the write side, and drain the
    /// reader until EOF or the grace period expires
    Shutdown,
}

/// Tunables for a binding
#[derive(Debug, Clone)]
pub struct BindingOptions {
    /// Maximum concurrently outstanding requests
    pub inflight_window: usize,
    /// Depth of the bounded write queue
    pub write_queue_depth: usize,
    /// How long to wait for server EOF after the write side closes
    pub close_grace: Duration,
    /// Language id reported in `didOpen` notifications
    pub language_id: String,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            inflight_window: 32,
            write_queue_depth: 64,
            close_grace: Duration::from_secs(2),
            language_id: "plaintext".to_string(),
        }
    }
}

#[derive(Default)]
struct CloseSignal {
    done: AtomicBool,
    notify: Notify,
}

/// A single connected language-server instance
pub struct Binding {
    id: usize,
    outbound: mpsc::Sender<WriteJob>,
    pending: Arc<PendingTable>,
    documents: DocumentStore,
    state: Arc<Mutex<BindingState>>,
    window: Arc<Semaphore>,
    server_capabilities: OnceLock<ServerCapabilities>,
    closed: Arc<CloseSignal>,
    close_grace: Duration,
}

impl Binding {
    /// Spawn the coordinator and dispatch worker over a transport
    pub fn start<T: Transport + 'static>(
        id: usize,
        transport: T,
        registry: Arc<SealedRegistry>,
        options: BindingOptions,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.write_queue_depth);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingTable::new());
        let state = Arc::new(Mutex::new(BindingState::New));
        let closed = Arc::new(CloseSignal::default());

        spawn_dispatch_worker(registry, outbound_tx.clone(), work_rx);

        let coordinator = Coordinator {
            id,
            pending: Arc::clone(&pending),
            state: Arc::clone(&state),
            closed: Arc::clone(&closed),
            work_tx,
            grace: options.close_grace,
        };
        tokio::spawn(coordinator.run(FrameCodec::new(transport), outbound_rx));

        Arc::new(Self {
            id,
            outbound: outbound_tx,
            pending,
            documents: DocumentStore::new(options.language_id.clone()),
            state,
            window: Arc::new(Semaphore::new(options.inflight_window)),
            server_capabilities: OnceLock::new(),
            closed,
            close_grace: options.close_grace,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> BindingState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: BindingState) {
        *self.state.lock().unwrap() = state;
    }

    /// Whether this binding can accept new work
    pub fn is_live(&self) -> bool {
        !matches!(self.state(), BindingState::Draining | BindingState::Down)
    }

    /// Number of requests awaiting a response
    pub fn outstanding(&self) -> usize {
        self.pending.outstanding()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.get()
    }

    pub(crate) fn set_server_capabilities(&self, capabilities: ServerCapabilities) {
        let _ = self.server_capabilities.set(capabilities);
    }

    pub(crate) fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// Issue a request and await its response
    pub(crate) async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        mode: SubmitMode,
    ) -> Result<Value, RequestError> {
        if !self.is_live() {
            return Err(RequestError::Terminated);
        }

        let _permit = match mode {
            SubmitMode::Wait => self
                .window
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RequestError::Terminated)?,
            SubmitMode::NoWait => self
                .window
                .clone()
                .try_acquire_owned()
                .map_err(|_| RequestError::Saturated)?,
        };

        let id = RequestId::fresh();
        let rx = self.pending.insert(&id)?;
        let request = jsonrpc::Request::new(id.clone(), method, params);
        let frame = serde_json::to_string(&request).map_err(RequestError::Serialize)?;

        crate::log_wire_message!(Level::DEBUG, self.id, "outgoing", method, &frame);

        let mut guard = CancelGuard::new(Arc::clone(&self.pending), self.outbound.clone(), id.clone());

        if self.outbound.send(WriteJob::Frame(frame)).await.is_err() {
            guard.disarm();
            self.pending.remove(&id);
            return Err(RequestError::Terminated);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(RawOutcome::Result(value))) => {
                guard.disarm();
                Ok(value)
            }
            Ok(Ok(RawOutcome::Error(error))) => {
                guard.disarm();
                Err(error.into())
            }
            Ok(Ok(RawOutcome::Terminated)) => {
                guard.disarm();
                Err(RequestError::Terminated)
            }
            // The entry was removed without an outcome: cancelled out
            // from under the waiter
            Ok(Err(_)) => {
                guard.disarm();
                Err(RequestError::Cancelled)
            }
            Err(_) => {
                guard.disarm();
                if self.pending.remove(&id) {
                    self.send_cancel(&id).await;
                }
                Err(RequestError::Timeout(timeout))
            }
        }
    }

    /// Send a notification
    pub(crate) async fn notify_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        if !self.is_live() {
            return Err(RequestError::Terminated);
        }

        let frame = jsonrpc::notification(method, params).to_string();
        crate::log_wire_message!(Level::DEBUG, self.id, "outgoing", method, &frame);

        self.outbound
            .send(WriteJob::Frame(frame))
            .await
            .map_err(|_| RequestError::Terminated)
    }

    /// Issue a document-scoped request: open the documents, send the
    /// request, and release the openings once the response is in
    pub(crate) async fn request_with_documents(
        &self,
        docs: Vec<PreparedDocument>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        mode: SubmitMode,
    ) -> Result<Value, RequestError> {
        let uris: Vec<Url> = docs.iter().map(|d| d.uri.clone()).collect();

        self.documents.acquire(&docs, &self.outbound).await?;
        let result = self.request_raw(method, params, timeout, mode).await;
        self.documents.release(&uris, &self.outbound).await;

        result
    }

    /// Open documents for an explicit caller-held scope
    pub(crate) async fn open_documents(&self, docs: &[PreparedDocument]) -> Result<(), RequestError> {
        self.documents.acquire(docs, &self.outbound).await
    }

    /// Close documents previously opened with [`Self::open_documents`]
    pub(crate) async fn close_documents(&self, uris: &[Url]) {
        self.documents.release(uris, &self.outbound).await;
    }

    /// Emit `didClose` for everything still open on this binding
    pub(crate) async fn close_all_documents(&self) {
        self.documents.close_all(&self.outbound).await;
    }

    /// Stop accepting writes, half-close, and wait for reader EOF
    pub(crate) async fn close(&self) -> bool {
        self.set_state(BindingState::Draining);
        let _ = self.outbound.send(WriteJob::Shutdown).await;
        self.wait_closed(self.close_grace + Duration::from_millis(500))
            .await
    }

    /// Fail all outstanding requests with `Terminated`
    pub(crate) fn cancel_all(&self) {
        self.pending.fail_all();
    }

    pub(crate) async fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.closed.done.load(Ordering::SeqCst) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let step = deadline.min(now + Duration::from_millis(50));
            let _ = tokio::time::timeout_at(step, self.closed.notify.notified()).await;
        }
    }

    async fn send_cancel(&self, id: &RequestId) {
        let frame = jsonrpc::cancel_notification(id).to_string();
        if self.outbound.send(WriteJob::Frame(frame)).await.is_err() {
            debug!("could not enqueue $/cancelRequest for {}", id);
        }
    }
}

/// Removes the pending entry and emits `$/cancelRequest` when a request
/// future is dropped before its response arrives
struct CancelGuard {
    pending: Arc<PendingTable>,
    outbound: mpsc::Sender<WriteJob>,
    id: RequestId,
    armed: bool,
}

impl CancelGuard {
    fn new(pending: Arc<PendingTable>, outbound: mpsc::Sender<WriteJob>, id: RequestId) -> Self {
        Self {
            pending,
            outbound,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.pending.remove(&self.id) {
            let frame = jsonrpc::cancel_notification(&self.id).to_string();
            if self.outbound.try_send(WriteJob::Frame(frame)).is_err() {
                debug!("could not enqueue $/cancelRequest for {}", self.id);
            }
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

struct Coordinator {
    id: usize,
    pending: Arc<PendingTable>,
    state: Arc<Mutex<BindingState>>,
    closed: Arc<CloseSignal>,
    work_tx: mpsc::UnboundedSender<InboundWork>,
    grace: Duration,
}

impl Coordinator {
    async fn run<T: Transport + 'static>(
        self,
        framed: FrameCodec<T>,
        mut outbound_rx: mpsc::Receiver<WriteJob>,
    ) {
        // Shared between the write and read arms of the select; whichever
        // arm loses has its lock attempt dropped with its future
        let transport = Arc::new(tokio::sync::Mutex::new(framed));
        let mut draining = false;
        let mut deadline = tokio::time::Instant::now();

        loop {
            let mut begin_drain = false;
            let mut fatal = false;
            let mut eof = false;

            tokio::select! {
                job = outbound_rx.recv(), if !draining => {
                    match job {
                        Some(WriteJob::Frame(frame)) => {
                            let mut framed = transport.lock().await;
                            if let Err(e) = write_with_backoff(&mut framed, &frame).await {
                                error!("write to server failed after retries: {}", e);
                                fatal = true;
                            }
                        }
                        Some(WriteJob::Shutdown) | None => begin_drain = true,
                    }
                }
                inbound = async {
                    let mut framed = transport.lock().await;
                    framed.receive().await
                } => {
                    match inbound {
                        Ok(body) => {
                            if !self.handle_frame(&body) {
                                fatal = true;
                            }
                        }
                        Err(e) if e.is_disconnect() => {
                            if draining {
                                debug!("server closed the stream after drain");
                            } else {
                                warn!("server closed the stream unexpectedly");
                            }
                            eof = true;
                        }
                        Err(e) => {
                            error!("framing error from server: {}", e);
                            fatal = true;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if draining => {
                    warn!("grace period expired waiting for server EOF, forcing close");
                    eof = true;
                }
            }

            if fatal || eof {
                break;
            }

            if begin_drain {
                // Flush frames already queued, then half-close the write
                // side and read until EOF or the grace period expires
                while let Ok(job) = outbound_rx.try_recv() {
                    if let WriteJob::Frame(frame) = job {
                        let mut framed = transport.lock().await;
                        if write_with_backoff(&mut framed, &frame).await.is_err() {
                            break;
                        }
                    }
                }
                let mut framed = transport.lock().await;
                if let Err(e) = framed.shutdown_write().await {
                    debug!("write half-close failed: {}", e);
                }
                draining = true;
                deadline = tokio::time::Instant::now() + self.grace;
            }
        }

        {
            let mut framed = transport.lock().await;
            let _ = framed.close().await;
        }
        self.pending.fail_all();
        *self.state.lock().unwrap() = BindingState::Down;
        self.closed.done.store(true, Ordering::SeqCst);
        self.closed.notify.notify_waiters();
        debug!("binding coordinator finished");
    }

    /// Returns false on a protocol violation, which is fatal to the binding
    fn handle_frame(&self, body: &str) -> bool {
        match jsonrpc::classify(body) {
            Ok(Message::Response { id, result, error }) => {
                let key = jsonrpc::id_key(&id);
                crate::log_wire_message!(Level::DEBUG, self.id, "incoming", "<response>", &key);

                let outcome = match error {
                    Some(error) => RawOutcome::Error(error),
                    None => RawOutcome::Result(result.unwrap_or(Value::Null)),
                };
                if !self.pending.complete(&key, outcome) {
                    debug!("dropping response for unknown or completed request {}", key);
                }
                true
            }
            Ok(Message::Notification { method, params }) => {
                crate::log_wire_message!(Level::DEBUG, self.id, "incoming", method.as_str(), &params);
                let _ = self.work_tx.send(InboundWork::Notification { method, params });
                true
            }
            Ok(Message::Request { id, method, params }) => {
                crate::log_wire_message!(Level::DEBUG, self.id, "incoming", method.as_str(), &params);
                let _ = self.work_tx.send(InboundWork::Request { id, method, params });
                true
            }
            Err(e) => {
                error!("protocol violation from server: {}", e);
                false
            }
        }
    }
}

async fn write_with_backoff<T: Transport>(
    framed: &mut FrameCodec<T>,
    frame: &str,
) -> Result<(), String> {
    let mut delay = Duration::from_millis(100);
    let mut last_error = String::new();

    for attempt in 1..=3u32 {
        match framed.send(frame).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                if attempt < 3 {
                    warn!(
                        "write attempt {} failed, retrying in {:?}: {}",
                        attempt, delay, last_error
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::CANCEL_REQUEST_METHOD;
    use crate::protocol::registry::HandlerRegistry;
    use crate::testing::transport_pair;

    fn test_binding<T: Transport + 'static>(transport: T) -> Arc<Binding> {
        let binding = Binding::start(
            0,
            transport,
            Arc::new(HandlerRegistry::new().seal()),
            BindingOptions::default(),
        );
        binding.set_state(BindingState::Ready);
        binding
    }

    async fn next_request(server: &mut FrameCodec<crate::testing::PipeTransport>) -> (Value, String) {
        loop {
            let body = server.receive().await.unwrap();
            if let Message::Request { id, method, .. } = jsonrpc::classify(&body).unwrap() {
                return (id, method);
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_waiters() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        let timeout = Duration::from_secs(5);
        let first = binding.request_raw("test/a", None, timeout, SubmitMode::Wait);
        let second = binding.request_raw("test/b", None, timeout, SubmitMode::Wait);
        let third = binding.request_raw("test/c", None, timeout, SubmitMode::Wait);

        let server_task = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..3 {
                let (id, method) = next_request(&mut server).await;
                ids.push((id, method));
            }
            // Reply in reverse arrival order
            for (id, method) in ids.into_iter().rev() {
                let response =
                    jsonrpc::Response::success(id, serde_json::json!({ "for": method }));
                server.send(&serde_json::to_string(&response).unwrap()).await.unwrap();
            }
        });

        let (a, b, c) = tokio::join!(first, second, third);
        server_task.await.unwrap();

        assert_eq!(a.unwrap()["for"], "test/a");
        assert_eq!(b.unwrap()["for"], "test/b");
        assert_eq!(c.unwrap()["for"], "test/c");
        assert_eq!(binding.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timeout_emits_cancel_and_drops_late_reply() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        let result = binding
            .request_raw("slow/op", None, Duration::from_millis(50), SubmitMode::Wait)
            .await;
        assert!(matches!(result, Err(RequestError::Timeout(_))));

        // First the request, then the cancellation
        let (id, method) = next_request(&mut server).await;
        assert_eq!(method, "slow/op");

        let body = server.receive().await.unwrap();
        match jsonrpc::classify(&body).unwrap() {
            Message::Notification { method, params } => {
                assert_eq!(method, CANCEL_REQUEST_METHOD);
                assert_eq!(params.unwrap()["id"], id);
            }
            other => panic!("Expected cancel notification, got {other:?}"),
        }

        // A late reply for the cancelled id is dropped silently and the
        // binding keeps serving
        let late = jsonrpc::Response::success(id, serde_json::json!("late"));
        server.send(&serde_json::to_string(&late).unwrap()).await.unwrap();

        let next = binding.request_raw("next/op", None, Duration::from_secs(5), SubmitMode::Wait);
        let server_task = tokio::spawn(async move {
            let (id, _) = next_request(&mut server).await;
            let response = jsonrpc::Response::success(id, serde_json::json!("ok"));
            server.send(&serde_json::to_string(&response).unwrap()).await.unwrap();
        });

        assert_eq!(next.await.unwrap(), serde_json::json!("ok"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_request_future_emits_cancel() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        {
            let request =
                binding.request_raw("abandoned/op", None, Duration::from_secs(60), SubmitMode::Wait);
            tokio::pin!(request);
            // Poll once so the request hits the wire, then drop the future
            let _ = futures::poll!(request.as_mut());
        }

        let (_, method) = next_request(&mut server).await;
        assert_eq!(method, "abandoned/op");

        let body = server.receive().await.unwrap();
        match jsonrpc::classify(&body).unwrap() {
            Message::Notification { method, .. } => assert_eq!(method, CANCEL_REQUEST_METHOD),
            other => panic!("Expected cancel notification, got {other:?}"),
        }
        assert_eq!(binding.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_notifications_keep_send_order() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        for n in 0..8 {
            binding
                .notify_raw("seq/event", Some(serde_json::json!(n)))
                .await
                .unwrap();
        }

        for n in 0..8 {
            let body = server.receive().await.unwrap();
            match jsonrpc::classify(&body).unwrap() {
                Message::Notification { params, .. } => {
                    assert_eq!(params.unwrap(), serde_json::json!(n));
                }
                other => panic!("Expected notification, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_terminates_outstanding_requests() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        let pending = {
            let binding = Arc::clone(&binding);
            tokio::spawn(async move {
                binding
                    .request_raw("never/answered", None, Duration::from_secs(60), SubmitMode::Wait)
                    .await
            })
        };

        let _ = next_request(&mut server).await;

        assert!(binding.close().await);
        assert!(matches!(
            pending.await.unwrap(),
            Err(RequestError::Terminated)
        ));
        assert_eq!(binding.state(), BindingState::Down);
        assert_eq!(binding.outstanding(), 0);

        // New work is refused after close
        let refused = binding
            .request_raw("too/late", None, Duration::from_secs(1), SubmitMode::Wait)
            .await;
        assert!(matches!(refused, Err(RequestError::Terminated)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (client_end, server_end) = transport_pair();
        let binding = test_binding(client_end);
        let mut server = FrameCodec::new(server_end);

        server.send(r#"{"jsonrpc":"2.0"}"#).await.unwrap();

        assert!(binding.wait_closed(Duration::from_secs(2)).await);
        assert_eq!(binding.state(), BindingState::Down);
    }

    #[tokio::test]
    async fn test_nowait_submission_reports_saturation() {
        let (client_end, server_end) = transport_pair();
        let mut options = BindingOptions::default();
        options.inflight_window = 1;
        let binding = Binding::start(
            0,
            client_end,
            Arc::new(HandlerRegistry::new().seal()),
            options,
        );
        binding.set_state(BindingState::Ready);
        let mut server = FrameCodec::new(server_end);

        let held = {
            let binding = Arc::clone(&binding);
            tokio::spawn(async move {
                binding
                    .request_raw("held/op", None, Duration::from_secs(60), SubmitMode::Wait)
                    .await
            })
        };
        let (held_id, _) = next_request(&mut server).await;

        let saturated = binding
            .request_raw("fast/op", None, Duration::from_secs(1), SubmitMode::NoWait)
            .await;
        assert!(matches!(saturated, Err(RequestError::Saturated)));

        let response = jsonrpc::Response::success(held_id, Value::Null);
        server.send(&serde_json::to_string(&response).unwrap()).await.unwrap();
        held.await.unwrap().unwrap();
    }
}
