//! Text document synchronization feature
//!
//! Client support for `textDocument/didOpen`, `textDocument/didChange`
//! and `textDocument/didClose` is mandatory for document-scoped work;
//! the open/close pair is driven by the reference-counted sync guard,
//! while `didChange` is an explicit operation for callers editing an
//! open document.

use crate::capability::{CapabilityError, CapabilitySection, Feature};
use crate::protocol::pending::RequestError;
use crate::session::{Session, SessionError};
use lsp_types::{
    ClientCapabilities, DidChangeTextDocumentParams, ServerCapabilities,
    TextDocumentContentChangeEvent, TextDocumentSyncClientCapabilities,
    VersionedTextDocumentIdentifier,
};
use std::path::Path;

pub(crate) const DID_OPEN: &str = "textDocument/didOpen";
pub(crate) const DID_CHANGE: &str = "textDocument/didChange";
pub(crate) const DID_CLOSE: &str = "textDocument/didClose";

/// `textDocument/didOpen` / `didChange` / `didClose`
pub struct TextDocumentSync;

impl Feature for TextDocumentSync {
    fn name(&self) -> &'static str {
        "textDocumentSync"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[DID_OPEN, DID_CHANGE, DID_CLOSE]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        capabilities
            .text_document
            .get_or_insert_with(Default::default)
            .synchronization = Some(TextDocumentSyncClientCapabilities {
            dynamic_registration: Some(false),
            will_save: Some(false),
            will_save_wait_until: Some(false),
            did_save: Some(false),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if capabilities.text_document_sync.is_some() {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: DID_OPEN,
            })
        }
    }
}

impl Session {
    /// Replace the full text of an open document.
    ///
    /// The document must currently be open (via an active document scope
    /// or an in-flight document-scoped request); the server's view of an
    /// unopened file cannot be changed.
    pub async fn notify_did_change(
        &self,
        path: &Path,
        text: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.ensure_supported(DID_CHANGE)?;

        let uri = self.server_uri(path)?;
        let binding = self.binding_for_uris(std::slice::from_ref(&uri))?;

        let version = binding
            .documents()
            .next_version(&uri)
            .await
            .ok_or_else(|| SessionError::DocumentNotOpen(uri.clone()))?;

        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier { uri, version },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.into(),
            }],
        };
        let value = serde_json::to_value(params)
            .map_err(|e| SessionError::Rpc(RequestError::Serialize(e)))?;

        binding
            .notify_raw(DID_CHANGE, Some(value))
            .await
            .map_err(SessionError::Rpc)
    }
}
