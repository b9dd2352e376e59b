//! Reference-counted document synchronization
//!
//! Tracks which text documents a binding's server believes are open.
//! The first acquisition of a uri (0 -> 1) queues `textDocument/didOpen`;
//! the last release (1 -> 0) queues `textDocument/didClose`. Both
//! transitions happen under the store lock onto the binding's ordered
//! write queue, so `didOpen` always precedes any request carrying the
//! uri. Every request scope holds a reference for its full duration and
//! releases only after its response resolves, so `didClose` always
//! follows the completion of every request that referenced the uri.
//! Overlapping scopes share openings without re-reading files or
//! churning the server.

use crate::jsonrpc;
use crate::protocol::binding::WriteJob;
use crate::protocol::pending::RequestError;
use lsp_types::{
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, TextDocumentIdentifier,
    TextDocumentItem,
};
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use url::Url;

const DID_OPEN: &str = "textDocument/didOpen";
const DID_CLOSE: &str = "textDocument/didClose";

/// A document read from disk and translated to its server uri
#[derive(Debug, Clone)]
pub(crate) struct PreparedDocument {
    pub uri: Url,
    pub text: String,
}

struct DocEntry {
    open_count: u32,
    version: i32,
}

/// Per-binding map of open documents
pub(crate) struct DocumentStore {
    language_id: String,
    inner: Mutex<HashMap<Url, DocEntry>>,
}

impl DocumentStore {
    pub fn new(language_id: String) -> Self {
        Self {
            language_id,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Increment the open count of every document, emitting `didOpen` on
    /// 0 -> 1 transitions
    pub async fn acquire(
        &self,
        docs: &[PreparedDocument],
        outbound: &mpsc::Sender<WriteJob>,
    ) -> Result<(), RequestError> {
        let mut inner = self.inner.lock().await;

        for doc in docs {
            let entry = inner.entry(doc.uri.clone()).or_insert(DocEntry {
                open_count: 0,
                version: 0,
            });
            entry.open_count += 1;

            if entry.open_count == 1 {
                let params = DidOpenTextDocumentParams {
                    text_document: TextDocumentItem {
                        uri: doc.uri.clone(),
                        language_id: self.language_id.clone(),
                        version: entry.version,
                        text: doc.text.clone(),
                    },
                };
                let value = serde_json::to_value(params).map_err(RequestError::Serialize)?;
                let frame = jsonrpc::notification(DID_OPEN, Some(value)).to_string();
                outbound
                    .send(WriteJob::Frame(frame))
                    .await
                    .map_err(|_| RequestError::Terminated)?;
            }
        }

        Ok(())
    }

    /// Decrement the open count of every document, emitting `didClose`
    /// on 1 -> 0 transitions
    pub async fn release(&self, uris: &[Url], outbound: &mpsc::Sender<WriteJob>) {
        let mut inner = self.inner.lock().await;

        for uri in uris {
            let should_close = match inner.get_mut(uri) {
                None => false,
                Some(entry) => {
                    entry.open_count = entry.open_count.saturating_sub(1);
                    entry.open_count == 0
                }
            };

            if should_close {
                inner.remove(uri);
                send_did_close(uri, outbound).await;
            }
        }
    }

    /// Emit `didClose` for every document still open
    pub async fn close_all(&self, outbound: &mpsc::Sender<WriteJob>) {
        let mut inner = self.inner.lock().await;
        for (uri, _) in inner.drain() {
            send_did_close(&uri, outbound).await;
        }
    }

    /// Bump and return the version of an open document
    pub async fn next_version(&self, uri: &Url) -> Option<i32> {
        let mut inner = self.inner.lock().await;
        let entry = inner.get_mut(uri)?;
        entry.version += 1;
        Some(entry.version)
    }

    pub async fn is_open(&self, uri: &Url) -> bool {
        self.inner.lock().await.contains_key(uri)
    }

    pub async fn open_count(&self, uri: &Url) -> u32 {
        self.inner
            .lock()
            .await
            .get(uri)
            .map(|e| e.open_count)
            .unwrap_or(0)
    }

    pub async fn open_document_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

async fn send_did_close(uri: &Url, outbound: &mpsc::Sender<WriteJob>) {
    let params = DidCloseTextDocumentParams {
        text_document: TextDocumentIdentifier { uri: uri.clone() },
    };
    match serde_json::to_value(params) {
        Ok(value) => {
            let frame = jsonrpc::notification(DID_CLOSE, Some(value)).to_string();
            if outbound.send(WriteJob::Frame(frame)).await.is_err() {
                debug!("write queue closed before didClose for {} was sent", uri);
            }
        }
        Err(e) => debug!("failed to serialize didClose for {}: {}", uri, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(uri: &str) -> PreparedDocument {
        PreparedDocument {
            uri: Url::parse(uri).unwrap(),
            text: "content".to_string(),
        }
    }

    fn drain_methods(rx: &mut mpsc::Receiver<WriteJob>) -> Vec<String> {
        let mut methods = Vec::new();
        while let Ok(WriteJob::Frame(frame)) = rx.try_recv() {
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            methods.push(value["method"].as_str().unwrap_or("<response>").to_string());
        }
        methods
    }

    #[tokio::test]
    async fn test_open_close_pairing() {
        let store = DocumentStore::new("python".to_string());
        let (tx, mut rx) = mpsc::channel(64);
        let document = doc("file:///abs/a.py");
        let uri = document.uri.clone();

        store.acquire(&[document.clone()], &tx).await.unwrap();
        store.acquire(&[document], &tx).await.unwrap();
        assert_eq!(store.open_count(&uri).await, 2);

        store.release(&[uri.clone()], &tx).await;
        assert!(store.is_open(&uri).await);

        store.release(&[uri.clone()], &tx).await;
        assert!(!store.is_open(&uri).await);

        // Exactly one didOpen and one didClose despite two acquisitions
        assert_eq!(
            drain_methods(&mut rx),
            vec!["textDocument/didOpen", "textDocument/didClose"]
        );
    }

    #[tokio::test]
    async fn test_did_open_carries_language_and_version() {
        let store = DocumentStore::new("rust".to_string());
        let (tx, mut rx) = mpsc::channel(64);

        store
            .acquire(&[doc("file:///abs/lib.rs")], &tx)
            .await
            .unwrap();

        let Some(WriteJob::Frame(frame)) = rx.recv().await else {
            panic!("expected didOpen");
        };
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["params"]["textDocument"]["languageId"], "rust");
        assert_eq!(value["params"]["textDocument"]["version"], 0);
        assert_eq!(value["params"]["textDocument"]["text"], "content");
    }

    #[tokio::test]
    async fn test_version_bumps_only_while_open() {
        let store = DocumentStore::new("python".to_string());
        let (tx, _rx) = mpsc::channel(64);
        let document = doc("file:///abs/a.py");
        let uri = document.uri.clone();

        assert_eq!(store.next_version(&uri).await, None);

        store.acquire(&[document], &tx).await.unwrap();
        assert_eq!(store.next_version(&uri).await, Some(1));
        assert_eq!(store.next_version(&uri).await, Some(2));

        store.release(&[uri.clone()], &tx).await;
        assert_eq!(store.next_version(&uri).await, None);
    }

    #[tokio::test]
    async fn test_reopen_after_close_emits_did_open_again() {
        let store = DocumentStore::new("python".to_string());
        let (tx, mut rx) = mpsc::channel(64);
        let document = doc("file:///abs/a.py");
        let uri = document.uri.clone();

        store.acquire(&[document.clone()], &tx).await.unwrap();
        store.release(&[uri.clone()], &tx).await;
        store.acquire(&[document], &tx).await.unwrap();
        store.release(&[uri], &tx).await;

        assert_eq!(
            drain_methods(&mut rx),
            vec![
                "textDocument/didOpen",
                "textDocument/didClose",
                "textDocument/didOpen",
                "textDocument/didClose"
            ]
        );
    }

    #[tokio::test]
    async fn test_close_all_closes_everything() {
        let store = DocumentStore::new("python".to_string());
        let (tx, mut rx) = mpsc::channel(64);

        store
            .acquire(&[doc("file:///abs/a.py"), doc("file:///abs/b.py")], &tx)
            .await
            .unwrap();
        store.close_all(&tx).await;

        assert_eq!(store.open_document_count().await, 0);
        let methods = drain_methods(&mut rx);
        assert_eq!(
            methods
                .iter()
                .filter(|m| *m == "textDocument/didClose")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_duplicate_uris_in_one_acquisition_count_once_each() {
        let store = DocumentStore::new("python".to_string());
        let (tx, mut rx) = mpsc::channel(64);
        let document = doc("file:///abs/a.py");
        let uri = document.uri.clone();

        store
            .acquire(&[document.clone(), document], &tx)
            .await
            .unwrap();
        assert_eq!(store.open_count(&uri).await, 2);

        store.release(&[uri.clone(), uri.clone()], &tx).await;
        assert!(!store.is_open(&uri).await);

        assert_eq!(
            drain_methods(&mut rx),
            vec!["textDocument/didOpen", "textDocument/didClose"]
        );
    }
}
