//! Capability composition
//!
//! A session is assembled from feature modules. Each feature declares
//! the LSP methods it owns, contributes a fragment of the client
//! capability object sent in `initialize`, validates the server
//! capability object that comes back, and may register handlers for
//! server-initiated methods. A feature whose validator rejects fails
//! the whole session at startup, so callers never hit a runtime
//! "method not found" on a supported surface.

pub mod requests;
pub mod server;
pub mod sync;

pub use requests::{
    CallHierarchy, Completion, GotoDefinition, Hover, References, Rename, WorkspaceSymbol,
};
pub use server::{
    ConfigurationSync, DiagnosticsStore, PublishDiagnostics, WindowMessages,
    WorkspaceFoldersProvider,
};
pub use sync::TextDocumentSync;

use crate::config::ConfigurationStore;
use crate::protocol::registry::{HandlerRegistry, RegistryError};
use crate::uri::PathTranslator;
use lsp_types::{ClientCapabilities, OneOf, ServerCapabilities, WorkspaceFolder};
use std::sync::Arc;

/// Top-level section of the client capability object a feature
/// contributes to. Fill order is section order, then feature
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapabilitySection {
    General,
    TextDocument,
    Workspace,
    Window,
    NotebookDocument,
}

/// Error types for capability composition and validation
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("feature {feature} requires server support for {method}")]
    Unsupported {
        feature: &'static str,
        method: &'static str,
    },

    #[error("no feature in this session provides {method}")]
    NotProvided { method: String },
}

/// Context handed to features registering server-request handlers
pub struct HandlerContext {
    pub configuration: Arc<ConfigurationStore>,
    pub workspace_folders: Vec<WorkspaceFolder>,
    pub translator: Arc<dyn PathTranslator>,
}

/// A composable contribution to the client's protocol surface
pub trait Feature: Send + Sync + 'static {
    /// Stable feature name used in diagnostics
    fn name(&self) -> &'static str;

    /// Capability section this feature contributes to
    fn section(&self) -> CapabilitySection;

    /// LSP methods this feature owns
    fn methods(&self) -> &'static [&'static str];

    /// Additively fill this feature's fragment of the client
    /// capability object. A fragment must not overwrite a sibling's
    /// contribution at the same path.
    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities);

    /// Validate the server's reported capabilities
    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError>;

    /// Register handlers for server-initiated methods
    fn register_handlers(
        &self,
        registry: &mut HandlerRegistry,
        context: &HandlerContext,
    ) -> Result<(), RegistryError> {
        let _ = (registry, context);
        Ok(())
    }
}

/// Features in deterministic composition order: section, then
/// declaration order within a section
pub(crate) fn ordered_features(features: &[Arc<dyn Feature>]) -> Vec<Arc<dyn Feature>> {
    let mut ordered: Vec<Arc<dyn Feature>> = features.to_vec();
    ordered.sort_by_key(|f| f.section());
    ordered
}

/// Build the composed client capability object
pub(crate) fn compose_client_capabilities(features: &[Arc<dyn Feature>]) -> ClientCapabilities {
    let mut capabilities = ClientCapabilities::default();
    for feature in ordered_features(features) {
        feature.fill_client_capabilities(&mut capabilities);
    }
    capabilities
}

/// Run every feature's validator against a server capability object
pub(crate) fn validate_server_capabilities(
    features: &[Arc<dyn Feature>],
    capabilities: &ServerCapabilities,
) -> Result<(), CapabilityError> {
    for feature in features {
        feature.check_server_capabilities(capabilities)?;
    }
    Ok(())
}

/// True when a `bool | options` server capability enables the provider
pub(crate) fn provider_enabled<T>(provider: &Option<OneOf<bool, T>>) -> bool {
    matches!(provider, Some(OneOf::Left(true)) | Some(OneOf::Right(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_order_matches_composition_order() {
        assert!(CapabilitySection::General < CapabilitySection::TextDocument);
        assert!(CapabilitySection::TextDocument < CapabilitySection::Workspace);
        assert!(CapabilitySection::Workspace < CapabilitySection::Window);
        assert!(CapabilitySection::Window < CapabilitySection::NotebookDocument);
    }

    #[test]
    fn test_compose_is_additive_across_features() {
        let features: Vec<Arc<dyn Feature>> = vec![
            Arc::new(GotoDefinition),
            Arc::new(References),
            Arc::new(WorkspaceSymbol),
        ];

        let capabilities = compose_client_capabilities(&features);
        let text_document = capabilities.text_document.unwrap();
        assert!(text_document.definition.is_some());
        assert!(text_document.references.is_some());
        assert!(capabilities.workspace.unwrap().symbol.is_some());
    }

    #[test]
    fn test_provider_enabled() {
        assert!(provider_enabled::<()>(&Some(OneOf::Left(true))));
        assert!(provider_enabled(&Some(OneOf::Right(()))));
        assert!(!provider_enabled::<()>(&Some(OneOf::Left(false))));
        assert!(!provider_enabled::<()>(&None));
    }
}
