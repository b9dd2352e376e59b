//! Server-initiated traffic features
//!
//! Responders for `workspace/configuration`, `workspace/workspaceFolders`
//! and `window/showMessageRequest`, plus sinks for `window/logMessage`,
//! `window/showMessage` and `textDocument/publishDiagnostics`.

use crate::capability::{CapabilityError, CapabilitySection, Feature, HandlerContext};
use crate::session::{Session, SessionError};
use lsp_types::{
    ClientCapabilities, ConfigurationParams, Diagnostic,
    DidChangeConfigurationClientCapabilities, LogMessageParams, MessageActionItem, MessageType,
    PublishDiagnosticsClientCapabilities, PublishDiagnosticsParams, ServerCapabilities,
    ShowMessageParams, ShowMessageRequestClientCapabilities, ShowMessageRequestParams,
    WorkspaceFolder,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use url::Url;

const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";
const WORKSPACE_CONFIGURATION: &str = "workspace/configuration";
const WORKSPACE_FOLDERS: &str = "workspace/workspaceFolders";
const LOG_MESSAGE: &str = "window/logMessage";
const SHOW_MESSAGE: &str = "window/showMessage";
const SHOW_MESSAGE_REQUEST: &str = "window/showMessageRequest";
const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";

// ============================================================================
// Configuration exchange
// ============================================================================

/// `workspace/didChangeConfiguration` push and `workspace/configuration`
/// pull, both served from the session's configuration store
pub struct ConfigurationSync;

impl Feature for ConfigurationSync {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::Workspace
    }

    fn methods(&self) -> &'static [&'static str] {
        &[DID_CHANGE_CONFIGURATION, WORKSPACE_CONFIGURATION]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        let workspace = capabilities.workspace.get_or_insert_with(Default::default);
        workspace.did_change_configuration = Some(DidChangeConfigurationClientCapabilities {
            dynamic_registration: Some(false),
        });
        workspace.configuration = Some(true);
    }

    fn check_server_capabilities(
        &self,
        _capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn register_handlers(
        &self,
        registry: &mut crate::protocol::registry::HandlerRegistry,
        context: &HandlerContext,
    ) -> Result<(), crate::protocol::registry::RegistryError> {
        let configuration = Arc::clone(&context.configuration);
        let translator = Arc::clone(&context.translator);

        registry.on_request(WORKSPACE_CONFIGURATION, move |params: ConfigurationParams| {
            let configuration = Arc::clone(&configuration);
            let translator = Arc::clone(&translator);
            async move {
                let answers: Vec<Value> = params
                    .items
                    .iter()
                    .map(|item| {
                        let scope = item
                            .scope_uri
                            .as_ref()
                            .and_then(|uri| translator.to_host_path(uri).ok());
                        configuration.resolve(scope.as_deref(), item.section.as_deref())
                    })
                    .collect();
                debug!("answered workspace/configuration for {} items", answers.len());
                Ok(answers)
            }
        })
    }
}

// ============================================================================
// Workspace folders
// ============================================================================

/// Responds to the `workspace/workspaceFolders` server request with the
/// folders the session was constructed over
pub struct WorkspaceFoldersProvider;

impl Feature for WorkspaceFoldersProvider {
    fn name(&self) -> &'static str {
        "workspaceFolders"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::Workspace
    }

    fn methods(&self) -> &'static [&'static str] {
        &[WORKSPACE_FOLDERS]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        capabilities
            .workspace
            .get_or_insert_with(Default::default)
            .workspace_folders = Some(true);
    }

    fn check_server_capabilities(
        &self,
        _capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn register_handlers(
        &self,
        registry: &mut crate::protocol::registry::HandlerRegistry,
        context: &HandlerContext,
    ) -> Result<(), crate::protocol::registry::RegistryError> {
        let folders = context.workspace_folders.clone();
        registry.on_request(WORKSPACE_FOLDERS, move |_: Option<Value>| {
            let folders: Option<Vec<WorkspaceFolder>> = Some(folders.clone());
            async move { Ok(folders) }
        })
    }
}

// ============================================================================
// Window messages
// ============================================================================

/// Routes `window/logMessage` and `window/showMessage` into tracing and
/// answers `window/showMessageRequest` with no selected action
pub struct WindowMessages;

impl Feature for WindowMessages {
    fn name(&self) -> &'static str {
        "windowMessages"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::Window
    }

    fn methods(&self) -> &'static [&'static str] {
        &[LOG_MESSAGE, SHOW_MESSAGE, SHOW_MESSAGE_REQUEST]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        capabilities
            .window
            .get_or_insert_with(Default::default)
            .show_message = Some(ShowMessageRequestClientCapabilities {
            message_action_item: None,
        });
    }

    fn check_server_capabilities(
        &self,
        _capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn register_handlers(
        &self,
        registry: &mut crate::protocol::registry::HandlerRegistry,
        _context: &HandlerContext,
    ) -> Result<(), crate::protocol::registry::RegistryError> {
        registry.on_notification(LOG_MESSAGE, |params: LogMessageParams| async move {
            log_server_message("server log", params.typ, &params.message);
            Ok(())
        });

        registry.on_notification(SHOW_MESSAGE, |params: ShowMessageParams| async move {
            log_server_message("server message", params.typ, &params.message);
            Ok(())
        });

        registry.on_request(
            SHOW_MESSAGE_REQUEST,
            |params: ShowMessageRequestParams| async move {
                info!("server message request (unanswered): {}", params.message);
                Ok(None::<MessageActionItem>)
            },
        )
    }
}

fn log_server_message(kind: &str, typ: MessageType, message: &str) {
    if typ == MessageType::ERROR {
        error!("{}: {}", kind, message);
    } else if typ == MessageType::WARNING {
        warn!("{}: {}", kind, message);
    } else if typ == MessageType::INFO {
        info!("{}: {}", kind, message);
    } else {
        debug!("{}: {}", kind, message);
    }
}

// ============================================================================
// Published diagnostics
// ============================================================================

#[derive(Default)]
struct DiagnosticsInner {
    map: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    changed: Notify,
}

/// Shared sink for diagnostics the server pushes.
///
/// Clone one half into [`PublishDiagnostics`] and keep the other to
/// read or await diagnostics.
#[derive(Clone, Default)]
pub struct DiagnosticsStore {
    inner: Arc<DiagnosticsInner>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest diagnostics published for a uri
    pub fn get(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.inner.map.lock().unwrap().get(uri).cloned()
    }

    /// Await diagnostics for a uri, up to a timeout
    pub async fn wait_for(&self, uri: &Url, timeout: Duration) -> Option<Vec<Diagnostic>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(diagnostics) = self.get(uri) {
                return Some(diagnostics);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout_at(deadline, self.inner.changed.notified()).await;
        }
    }

    fn insert(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        self.inner.map.lock().unwrap().insert(uri, diagnostics);
        self.inner.changed.notify_waiters();
    }
}

/// `textDocument/publishDiagnostics` sink
pub struct PublishDiagnostics {
    store: DiagnosticsStore,
}

impl PublishDiagnostics {
    pub fn new(store: DiagnosticsStore) -> Self {
        Self { store }
    }
}

impl Feature for PublishDiagnostics {
    fn name(&self) -> &'static str {
        "publishDiagnostics"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[PUBLISH_DIAGNOSTICS]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        capabilities
            .text_document
            .get_or_insert_with(Default::default)
            .publish_diagnostics = Some(PublishDiagnosticsClientCapabilities::default());
    }

    fn check_server_capabilities(
        &self,
        _capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn register_handlers(
        &self,
        registry: &mut crate::protocol::registry::HandlerRegistry,
        _context: &HandlerContext,
    ) -> Result<(), crate::protocol::registry::RegistryError> {
        let store = self.store.clone();
        registry.on_notification(
            PUBLISH_DIAGNOSTICS,
            move |params: PublishDiagnosticsParams| {
                let store = store.clone();
                async move {
                    debug!(
                        "received {} diagnostics for {}",
                        params.diagnostics.len(),
                        params.uri
                    );
                    store.insert(params.uri, params.diagnostics);
                    Ok(())
                }
            },
        );
        Ok(())
    }
}

// ============================================================================
// Session-side configuration operations
// ============================================================================

impl Session {
    /// Deep-merge a patch into the global configuration and push the
    /// resolved settings to every binding
    pub async fn update_configuration(&self, patch: Value) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.configuration().update_global(patch);
        self.push_configuration().await
    }

    /// Register a glob-scoped configuration override and push the
    /// change to every binding
    pub async fn add_configuration_scope(
        &self,
        pattern: &str,
        tree: Value,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.configuration().add_scope(pattern, tree)?;
        self.push_configuration().await
    }
}
