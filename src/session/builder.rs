//! Session construction

use crate::capability::Feature;
use crate::io::Launcher;
use crate::session::session::{Session, SessionError};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Assembles a [`Session`] from workspace roots, feature modules and
/// engine tunables, then starts it against a launcher.
pub struct SessionBuilder {
    pub(crate) workspace_roots: Vec<PathBuf>,
    pub(crate) features: Vec<Arc<dyn Feature>>,
    pub(crate) initialization_options: Option<Value>,
    pub(crate) configuration: Option<Value>,
    pub(crate) pool_size: usize,
    pub(crate) language_id: String,
    pub(crate) request_timeout: Duration,
    pub(crate) initialize_timeout: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) close_grace: Duration,
    pub(crate) inflight_window: usize,
    pub(crate) write_queue_depth: usize,
}

impl SessionBuilder {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_roots: vec![workspace_root.into()],
            features: Vec::new(),
            initialization_options: None,
            configuration: None,
            pool_size: 1,
            language_id: "plaintext".to_string(),
            request_timeout: Duration::from_secs(5),
            initialize_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(2),
            inflight_window: 32,
            write_queue_depth: 64,
        }
    }

    /// Add a further workspace root (multi-root workspace)
    pub fn add_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_roots.push(root.into());
        self
    }

    /// Attach a feature module
    pub fn with_feature(mut self, feature: impl Feature) -> Self {
        self.features.push(Arc::new(feature));
        self
    }

    /// Attach an already-shared feature module
    pub fn with_shared_feature(mut self, feature: Arc<dyn Feature>) -> Self {
        self.features.push(feature);
        self
    }

    /// Server-specific initialization options sent with `initialize`
    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Initial global configuration tree
    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Number of equivalent server instances to run (default 1)
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Language id reported in `didOpen` notifications
    pub fn with_language_id(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = language_id.into();
        self
    }

    /// Per-request deadline (default 5s)
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Deadline for the `initialize` handshake (default 30s)
    pub fn with_initialize_timeout(mut self, timeout: Duration) -> Self {
        self.initialize_timeout = timeout;
        self
    }

    /// How long shutdown waits for in-flight requests (default 5s)
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Grace period for server EOF after the write side closes (default 2s)
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Per-binding bound on concurrently outstanding requests (default 32)
    pub fn with_inflight_window(mut self, window: usize) -> Self {
        self.inflight_window = window.max(1);
        self
    }

    /// Launch the servers, run the handshake, validate capabilities and
    /// return the running session
    pub async fn start<L: Launcher>(self, launcher: &L) -> Result<Session, SessionError> {
        Session::start(self, launcher).await
    }
}
