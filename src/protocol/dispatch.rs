//! Inbound dispatcher
//!
//! Handler work is never run on the reader loop. The reader hands
//! classified server traffic to a per-binding worker task: notifications
//! run their handler chain sequentially, preserving arrival order per
//! method; server requests are spawned as independent tasks so their
//! handlers may issue further client requests without stalling either the
//! worker or the reader.

use crate::jsonrpc::{ErrorObject, Response};
use crate::protocol::binding::WriteJob;
use crate::protocol::registry::SealedRegistry;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Work item produced by the reader loop
#[derive(Debug)]
pub(crate) enum InboundWork {
    Notification {
        method: String,
        params: Option<Value>,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
}

/// Spawn the dispatch worker for one binding
pub(crate) fn spawn_dispatch_worker(
    registry: Arc<SealedRegistry>,
    outbound: mpsc::Sender<WriteJob>,
    mut work_rx: mpsc::UnboundedReceiver<InboundWork>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(work) = work_rx.recv().await {
            match work {
                InboundWork::Notification { method, params } => {
                    handle_notification(&registry, &method, params).await;
                }
                InboundWork::Request { id, method, params } => {
                    let registry = Arc::clone(&registry);
                    let outbound = outbound.clone();
                    tokio::spawn(async move {
                        respond_to_server_request(&registry, &outbound, id, &method, params).await;
                    });
                }
            }
        }
        debug!("dispatch worker finished");
    })
}

/// Run every handler registered for a notification, in order
async fn handle_notification(registry: &SealedRegistry, method: &str, params: Option<Value>) {
    let Some(handlers) = registry.notification_handlers(method) else {
        debug!("dropping unhandled notification: {}", method);
        return;
    };

    for handler in handlers {
        if let Err(e) = handler(params.clone()).await {
            warn!("notification handler for {} failed: {}", method, e);
        }
    }
}

/// Invoke the single responder for a server request and send its reply
async fn respond_to_server_request(
    registry: &SealedRegistry,
    outbound: &mpsc::Sender<WriteJob>,
    id: Value,
    method: &str,
    params: Option<Value>,
) {
    let response = match registry.request_handler(method) {
        Some(handler) => match handler(params).await {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                warn!("request handler for {} failed: {}", method, e);
                Response::error(id, ErrorObject::new(e.code, e.message))
            }
        },
        None => {
            debug!("no handler for server request: {}", method);
            Response::error(id, ErrorObject::method_not_found(method))
        }
    };

    let frame = match serde_json::to_string(&response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("failed to serialize response to {}: {}", method, e);
            return;
        }
    };

    if outbound.send(WriteJob::Frame(frame)).await.is_err() {
        debug!("write queue closed before response to {} was sent", method);
    }
}
