//! Session implementation
//!
//! Owns the pool of bindings, the configuration store and the validated
//! operation surface. All caller-visible operations require the
//! `Running` state; construction fails hard when any feature's
//! capability validator rejects, so a session that exists can reach
//! every operation its features declare.

use crate::capability::{
    CapabilityError, HandlerContext, compose_client_capabilities, ordered_features,
    validate_server_capabilities,
};
use crate::config::{ConfigError, ConfigurationStore};
use crate::io::process::{LaunchError, Launcher, ServerHandle};
use crate::jsonrpc::ProtocolError;
use crate::pool::{PoolError, ServerPool};
use crate::protocol::binding::{Binding, BindingOptions, BindingState, SubmitMode};
use crate::protocol::pending::RequestError;
use crate::protocol::registry::{HandlerRegistry, RegistryError};
use crate::session::builder::SessionBuilder;
use crate::session::documents::PreparedDocument;
use crate::uri::{PathTranslator, UriError};
use lsp_types::{
    ClientInfo, DidChangeConfigurationParams, InitializeParams, InitializeResult, Position,
    TextDocumentIdentifier, TextDocumentPositionParams, WorkspaceFolder,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Initializing,
    Running,
    ShuttingDown,
    Terminated,
}

/// Error types surfaced by session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Rpc(#[from] RequestError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("cannot read {path}")]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document is not open: {0}")]
    DocumentNotOpen(Url),

    #[error("pool is saturated")]
    PoolSaturated,

    #[error("no live server bindings remain")]
    NoLiveBindings,

    #[error("session is {0:?}, not running")]
    NotRunning(SessionState),

    #[error("initialize failed: {0}")]
    Initialize(String),
}

impl From<PoolError> for SessionError {
    fn from(_: PoolError) -> Self {
        SessionError::NoLiveBindings
    }
}

fn map_rpc(error: RequestError) -> SessionError {
    match error {
        RequestError::Saturated => SessionError::PoolSaturated,
        error => SessionError::Rpc(error),
    }
}

/// A running LSP client session over a pool of equivalent servers
pub struct Session {
    state: Mutex<SessionState>,
    pool: ServerPool,
    handles: AsyncMutex<Vec<Box<dyn ServerHandle>>>,
    /// method -> owning feature, for the validated operation surface
    surface: HashMap<&'static str, &'static str>,
    configuration: Arc<ConfigurationStore>,
    translator: Arc<dyn PathTranslator>,
    folders: Vec<WorkspaceFolder>,
    roots: Vec<PathBuf>,
    request_timeout: Duration,
    drain_timeout: Duration,
    terminated: AtomicBool,
}

impl Session {
    pub(crate) async fn start<L: Launcher>(
        builder: SessionBuilder,
        launcher: &L,
    ) -> Result<Self, SessionError> {
        let translator = launcher.translator();
        let configuration = Arc::new(ConfigurationStore::new(
            builder
                .configuration
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())),
        ));

        let (roots, folders) = resolve_workspace(&builder.workspace_roots, translator.as_ref())?;

        let context = HandlerContext {
            configuration: Arc::clone(&configuration),
            workspace_folders: folders.clone(),
            translator: Arc::clone(&translator),
        };

        let mut registry = HandlerRegistry::new();
        for feature in ordered_features(&builder.features) {
            feature.register_handlers(&mut registry, &context)?;
        }
        let registry = Arc::new(registry.seal());

        let capabilities = compose_client_capabilities(&builder.features);

        info!(
            "starting session: {} feature(s), pool size {}",
            builder.features.len(),
            builder.pool_size
        );

        let mut bindings: Vec<Arc<Binding>> = Vec::new();
        let mut handles: Vec<Box<dyn ServerHandle>> = Vec::new();
        for id in 0..builder.pool_size {
            let (transport, handle) = match launcher.launch().await {
                Ok(launched) => launched,
                Err(e) => {
                    abort(&bindings, &mut handles).await;
                    return Err(e.into());
                }
            };
            let options = BindingOptions {
                inflight_window: builder.inflight_window,
                write_queue_depth: builder.write_queue_depth,
                close_grace: builder.close_grace,
                language_id: builder.language_id.clone(),
            };
            bindings.push(Binding::start(id, transport, Arc::clone(&registry), options));
            handles.push(Box::new(handle));
        }

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: folders.first().map(|f| f.uri.clone()),
            initialization_options: builder.initialization_options.clone(),
            capabilities,
            client_info: Some(ClientInfo {
                name: "lsp-conduit".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            workspace_folders: Some(folders.clone()),
            ..Default::default()
        };
        let params_value = match serde_json::to_value(params) {
            Ok(value) => value,
            Err(e) => {
                abort(&bindings, &mut handles).await;
                return Err(SessionError::Rpc(RequestError::Serialize(e)));
            }
        };

        // Client-level handshake: every binding initializes with the same
        // parameters; any failure fails the whole session
        for binding in &bindings {
            binding.set_state(BindingState::Initializing);
            let raw = match binding
                .request_raw(
                    "initialize",
                    Some(params_value.clone()),
                    builder.initialize_timeout,
                    SubmitMode::Wait,
                )
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    abort(&bindings, &mut handles).await;
                    return Err(map_rpc(e));
                }
            };
            let result: InitializeResult = match serde_json::from_value(raw) {
                Ok(result) => result,
                Err(e) => {
                    abort(&bindings, &mut handles).await;
                    return Err(SessionError::Initialize(e.to_string()));
                }
            };
            debug!(
                "binding {} initialized (server: {:?})",
                binding.id(),
                result.server_info.as_ref().map(|i| i.name.as_str())
            );
            binding.set_server_capabilities(result.capabilities);
        }

        // Validate every feature fragment before `initialized` goes out;
        // a rejection means no operation was ever reachable
        for binding in &bindings {
            let Some(server_capabilities) = binding.server_capabilities() else {
                continue;
            };
            if let Err(e) = validate_server_capabilities(&builder.features, server_capabilities) {
                warn!("capability validation failed: {}", e);
                abort(&bindings, &mut handles).await;
                return Err(e.into());
            }
        }

        for binding in &bindings {
            if let Err(e) = binding
                .notify_raw("initialized", Some(Value::Object(Default::default())))
                .await
            {
                abort(&bindings, &mut handles).await;
                return Err(map_rpc(e));
            }
            binding.set_state(BindingState::Ready);
        }

        let surface = builder
            .features
            .iter()
            .flat_map(|feature| {
                let name = feature.name();
                feature.methods().iter().map(move |method| (*method, name))
            })
            .collect();

        info!("session running with {} binding(s)", bindings.len());

        Ok(Self {
            state: Mutex::new(SessionState::Running),
            pool: ServerPool::new(bindings),
            handles: AsyncMutex::new(handles),
            surface,
            configuration,
            translator,
            folders,
            roots,
            request_timeout: builder.request_timeout,
            drain_timeout: builder.drain_timeout,
            terminated: AtomicBool::new(false),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Workspace folders the session was constructed over
    pub fn workspace_folders(&self) -> &[WorkspaceFolder] {
        &self.folders
    }

    /// The session's configuration store
    pub fn configuration(&self) -> &Arc<ConfigurationStore> {
        &self.configuration
    }

    /// Capabilities reported by the first server of the pool
    pub fn server_capabilities(&self) -> Option<&lsp_types::ServerCapabilities> {
        self.pool
            .bindings()
            .first()
            .and_then(|binding| binding.server_capabilities())
    }

    /// Whether the validated operation surface includes a method
    pub fn supports(&self, method: &str) -> bool {
        self.surface.contains_key(method)
    }

    pub(crate) fn ensure_supported(&self, method: &str) -> Result<(), SessionError> {
        if self.supports(method) {
            Ok(())
        } else {
            Err(CapabilityError::NotProvided {
                method: method.to_string(),
            }
            .into())
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Running {
            return Err(SessionError::NotRunning(state));
        }
        if !self.pool.has_live_bindings() {
            self.set_state(SessionState::ShuttingDown);
            return Err(SessionError::NoLiveBindings);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Path and uri plumbing
    // ------------------------------------------------------------------

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            match self.roots.first() {
                Some(root) => root.join(path),
                None => path.to_path_buf(),
            }
        }
    }

    /// The uri the server sees for a host path (relative paths resolve
    /// against the first workspace root)
    pub fn server_uri(&self, path: &Path) -> Result<Url, SessionError> {
        Ok(self.translator.to_server_uri(&self.absolutize(path))?)
    }

    /// The host path for a server-reported uri
    pub fn host_path(&self, uri: &Url) -> Result<PathBuf, SessionError> {
        Ok(self.translator.to_host_path(uri)?)
    }

    pub(crate) fn document_position(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<TextDocumentPositionParams, SessionError> {
        Ok(TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: self.server_uri(path)?,
            },
            position,
        })
    }

    async fn prepare_documents(
        &self,
        paths: &[&Path],
    ) -> Result<Vec<PreparedDocument>, SessionError> {
        let mut seen = HashSet::new();
        let mut documents = Vec::new();

        for path in paths {
            let absolute = self.absolutize(path);
            let uri = self.translator.to_server_uri(&absolute)?;
            if !seen.insert(uri.clone()) {
                continue;
            }
            let text = tokio::fs::read_to_string(&absolute)
                .await
                .map_err(|source| SessionError::FileNotFound {
                    path: absolute.clone(),
                    source,
                })?;
            documents.push(PreparedDocument { uri, text });
        }

        Ok(documents)
    }

    pub(crate) fn binding_for_uris(&self, uris: &[Url]) -> Result<Arc<Binding>, SessionError> {
        Ok(self.pool.for_documents(uris)?)
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    /// Issue a document-scoped request, keeping the referenced documents
    /// open on the routed binding for the duration
    pub async fn request_for_documents<P, R>(
        &self,
        method: &'static str,
        params: &P,
        paths: &[&Path],
    ) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.request_for_documents_with(method, params, paths, SubmitMode::Wait)
            .await
    }

    /// Document-scoped request with explicit submission mode; `NoWait`
    /// surfaces saturation instead of awaiting a pool slot
    pub async fn request_for_documents_with<P, R>(
        &self,
        method: &'static str,
        params: &P,
        paths: &[&Path],
        mode: SubmitMode,
    ) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.ensure_running()?;
        self.ensure_supported(method)?;

        let documents = self.prepare_documents(paths).await?;
        let uris: Vec<Url> = documents.iter().map(|d| d.uri.clone()).collect();
        let binding = self.pool.for_documents(&uris)?;

        let value = serde_json::to_value(params)
            .map_err(|e| SessionError::Rpc(RequestError::Serialize(e)))?;
        let raw = binding
            .request_with_documents(documents, method, Some(value), self.request_timeout, mode)
            .await
            .map_err(map_rpc)?;

        serde_json::from_value(raw).map_err(|e| SessionError::Rpc(RequestError::Deserialize(e)))
    }

    /// Issue a workspace-scoped request on the least-loaded binding
    pub async fn request_workspace<P, R>(
        &self,
        method: &'static str,
        params: &P,
    ) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.request_workspace_with(method, params, SubmitMode::Wait)
            .await
    }

    /// Workspace-scoped request with explicit submission mode
    pub async fn request_workspace_with<P, R>(
        &self,
        method: &'static str,
        params: &P,
        mode: SubmitMode,
    ) -> Result<R, SessionError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.ensure_running()?;
        self.ensure_supported(method)?;

        let binding = self.pool.least_loaded()?;
        let value = serde_json::to_value(params)
            .map_err(|e| SessionError::Rpc(RequestError::Serialize(e)))?;
        let raw = binding
            .request_raw(method, Some(value), self.request_timeout, mode)
            .await
            .map_err(map_rpc)?;

        serde_json::from_value(raw).map_err(|e| SessionError::Rpc(RequestError::Deserialize(e)))
    }

    /// Send a notification to every live binding
    pub async fn notify_broadcast<P: Serialize>(
        &self,
        method: &'static str,
        params: &P,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.ensure_supported(method)?;

        let value = serde_json::to_value(params)
            .map_err(|e| SessionError::Rpc(RequestError::Serialize(e)))?;
        self.pool
            .broadcast_notify(method, Some(value))
            .await
            .map_err(map_rpc)
    }

    pub(crate) async fn push_configuration(&self) -> Result<(), SessionError> {
        if !self.supports("workspace/didChangeConfiguration") {
            return Ok(());
        }

        let settings = self.configuration.resolve(None, None);
        let value = serde_json::to_value(DidChangeConfigurationParams { settings })
            .map_err(|e| SessionError::Rpc(RequestError::Serialize(e)))?;
        self.pool
            .broadcast_notify("workspace/didChangeConfiguration", Some(value))
            .await
            .map_err(map_rpc)
    }

    // ------------------------------------------------------------------
    // Document scopes
    // ------------------------------------------------------------------

    /// Open documents for a caller-held scope. Requests issued for the
    /// same paths while the guard lives share the openings; `didClose`
    /// is deferred until the guard closes and all in-flight requests
    /// referencing the documents have completed.
    pub async fn with_documents(&self, paths: &[&Path]) -> Result<DocumentsGuard, SessionError> {
        self.ensure_running()?;
        self.ensure_supported("textDocument/didOpen")?;

        let documents = self.prepare_documents(paths).await?;
        let uris: Vec<Url> = documents.iter().map(|d| d.uri.clone()).collect();
        let binding = self.pool.for_documents(&uris)?;

        binding.open_documents(&documents).await.map_err(map_rpc)?;

        Ok(DocumentsGuard {
            binding,
            uris: Some(uris),
        })
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Gracefully shut down: drain in-flight requests, close open
    /// documents, then `shutdown` + `exit` each binding and reap the
    /// server processes. Consumes the session.
    pub async fn close(self) -> Result<(), SessionError> {
        self.set_state(SessionState::ShuttingDown);
        info!("session shutting down");

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while self.pool.outstanding() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.pool.outstanding() > 0 {
            warn!(
                "{} request(s) still in flight at the drain deadline",
                self.pool.outstanding()
            );
        }

        for binding in self.pool.bindings() {
            if !binding.is_live() {
                binding.cancel_all();
                continue;
            }

            binding.close_all_documents().await;

            match binding
                .request_raw("shutdown", None, self.request_timeout, SubmitMode::Wait)
                .await
            {
                Ok(_) => debug!("binding {} acknowledged shutdown", binding.id()),
                Err(e) => warn!("shutdown request failed on binding {}: {}", binding.id(), e),
            }

            if let Err(e) = binding.notify_raw("exit", None).await {
                debug!("exit notification failed on binding {}: {}", binding.id(), e);
            }

            if !binding.close().await {
                warn!(
                    "binding {} did not reach EOF within the grace period",
                    binding.id()
                );
            }
        }

        {
            let mut handles = self.handles.lock().await;
            for handle in handles.iter_mut() {
                if let Err(e) = handle.kill().await {
                    warn!("failed to reap server process: {}", e);
                }
            }
        }

        self.set_state(SessionState::Terminated);
        self.terminated.store(true, Ordering::SeqCst);
        info!("session terminated");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }

        warn!("session dropped without close(), force-killing server processes");
        if let Ok(mut handles) = self.handles.try_lock() {
            for handle in handles.iter_mut() {
                handle.start_kill();
            }
        }
    }
}

/// Caller-held document scope returned by [`Session::with_documents`]
pub struct DocumentsGuard {
    binding: Arc<Binding>,
    uris: Option<Vec<Url>>,
}

impl DocumentsGuard {
    /// The server uris held open by this guard
    pub fn uris(&self) -> &[Url] {
        self.uris.as_deref().unwrap_or(&[])
    }

    /// Release the openings, emitting `didClose` for documents whose
    /// open count reaches zero
    pub async fn close(mut self) {
        if let Some(uris) = self.uris.take() {
            self.binding.close_documents(&uris).await;
        }
    }
}

impl Drop for DocumentsGuard {
    fn drop(&mut self) {
        let Some(uris) = self.uris.take() else {
            return;
        };
        let binding = Arc::clone(&self.binding);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                binding.close_documents(&uris).await;
            });
        }
    }
}

fn resolve_workspace(
    roots: &[PathBuf],
    translator: &dyn PathTranslator,
) -> Result<(Vec<PathBuf>, Vec<WorkspaceFolder>), SessionError> {
    let mut absolute_roots = Vec::new();
    let mut folders = Vec::new();

    for root in roots {
        let absolute =
            std::path::absolute(root).map_err(|source| SessionError::FileNotFound {
                path: root.clone(),
                source,
            })?;
        let uri = translator.to_server_uri(&absolute)?;
        let name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        folders.push(WorkspaceFolder { uri, name });
        absolute_roots.push(absolute);
    }

    Ok((absolute_roots, folders))
}

async fn abort(bindings: &[Arc<Binding>], handles: &mut Vec<Box<dyn ServerHandle>>) {
    for binding in bindings {
        binding.close().await;
    }
    for handle in handles.iter_mut() {
        if let Err(e) = handle.kill().await {
            debug!("failed to reap server process during abort: {}", e);
        }
    }
}
