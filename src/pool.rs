//! Server pool
//!
//! Routes requests across N equivalent bindings. Document-scoped
//! requests hash their uri set so a given document is always opened on
//! the same binding; workspace-scoped requests go to the binding with
//! the fewest outstanding requests; broadcast traffic fans out to every
//! live binding. Bindings that go down drop out of rotation.

use crate::protocol::binding::Binding;
use crate::protocol::pending::RequestError;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Error types for request routing
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no live server bindings remain")]
    NoLiveBindings,
}

pub struct ServerPool {
    bindings: Vec<Arc<Binding>>,
}

impl ServerPool {
    pub fn new(bindings: Vec<Arc<Binding>>) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &[Arc<Binding>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn live(&self) -> Vec<&Arc<Binding>> {
        self.bindings.iter().filter(|b| b.is_live()).collect()
    }

    /// Whether any binding can still accept work
    pub fn has_live_bindings(&self) -> bool {
        self.bindings.iter().any(|b| b.is_live())
    }

    /// Pick the binding for a document-scoped request.
    ///
    /// The sorted, deduplicated uri set is hashed over the live
    /// bindings, so every request touching the same documents lands on
    /// the same server and document-sync state stays partitioned.
    pub fn for_documents(&self, uris: &[Url]) -> Result<Arc<Binding>, PoolError> {
        let live = self.live();
        if live.is_empty() {
            return Err(PoolError::NoLiveBindings);
        }

        let mut keys: Vec<&str> = uris.iter().map(Url::as_str).collect();
        keys.sort_unstable();
        keys.dedup();

        let mut hasher = DefaultHasher::new();
        for key in keys {
            key.hash(&mut hasher);
        }
        let index = (hasher.finish() as usize) % live.len();

        let binding = Arc::clone(live[index]);
        debug!(
            "routing document-scoped request to binding {} ({} live)",
            binding.id(),
            live.len()
        );
        Ok(binding)
    }

    /// Pick the least-loaded binding for a workspace-scoped request
    pub fn least_loaded(&self) -> Result<Arc<Binding>, PoolError> {
        self.live()
            .into_iter()
            .min_by_key(|b| (b.outstanding(), b.id()))
            .map(Arc::clone)
            .ok_or(PoolError::NoLiveBindings)
    }

    /// Send a notification to every live binding
    pub async fn broadcast_notify(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        let live = self.live();
        if live.is_empty() {
            return Err(RequestError::Terminated);
        }

        for binding in live {
            binding.notify_raw(method, params.clone()).await?;
        }
        Ok(())
    }

    /// Total outstanding requests across all bindings
    pub fn outstanding(&self) -> usize {
        self.bindings.iter().map(|b| b.outstanding()).sum()
    }
}
