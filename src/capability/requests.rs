//! Request features
//!
//! Each feature owns one request method (or a small family, for call
//! hierarchy), contributes its client capability fragment, validates
//! the matching server capability, and provides its typed operations on
//! [`Session`].
//!
//! List-valued operations return `Option<Vec<..>>`-shaped payloads: a
//! `null` result stays `None` and an empty array stays `Some(vec![])`,
//! exactly as the server answered.

use crate::capability::{CapabilityError, CapabilitySection, Feature, provider_enabled};
use crate::session::{Session, SessionError};
use lsp_types::{
    CallHierarchyClientCapabilities, CallHierarchyIncomingCall, CallHierarchyIncomingCallsParams,
    CallHierarchyItem, CallHierarchyOutgoingCall, CallHierarchyOutgoingCallsParams,
    CallHierarchyPrepareParams, CallHierarchyServerCapability, ClientCapabilities,
    CompletionClientCapabilities, CompletionParams, CompletionResponse, GotoCapability,
    GotoDefinitionParams, GotoDefinitionResponse, Hover as HoverResult, HoverClientCapabilities,
    HoverParams, HoverProviderCapability, Location, MarkupKind, Position,
    ReferenceClientCapabilities, ReferenceContext, ReferenceParams, RenameClientCapabilities,
    RenameParams, ServerCapabilities, WorkspaceClientCapabilities, WorkspaceEdit,
    WorkspaceSymbolClientCapabilities, WorkspaceSymbolParams, WorkspaceSymbolResponse,
};
use std::path::Path;

const DEFINITION: &str = "textDocument/definition";
const REFERENCES: &str = "textDocument/references";
const HOVER: &str = "textDocument/hover";
const COMPLETION: &str = "textDocument/completion";
const RENAME: &str = "textDocument/rename";
const WORKSPACE_SYMBOL: &str = "workspace/symbol";
const PREPARE_CALL_HIERARCHY: &str = "textDocument/prepareCallHierarchy";
const INCOMING_CALLS: &str = "callHierarchy/incomingCalls";
const OUTGOING_CALLS: &str = "callHierarchy/outgoingCalls";

fn text_document(
    capabilities: &mut ClientCapabilities,
) -> &mut lsp_types::TextDocumentClientCapabilities {
    capabilities.text_document.get_or_insert_with(Default::default)
}

fn workspace(capabilities: &mut ClientCapabilities) -> &mut WorkspaceClientCapabilities {
    capabilities.workspace.get_or_insert_with(Default::default)
}

// ============================================================================
// textDocument/definition
// ============================================================================

/// `textDocument/definition`
pub struct GotoDefinition;

impl Feature for GotoDefinition {
    fn name(&self) -> &'static str {
        "gotoDefinition"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[DEFINITION]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).definition = Some(GotoCapability {
            dynamic_registration: Some(false),
            link_support: Some(true),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if provider_enabled(&capabilities.definition_provider) {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: DEFINITION,
            })
        }
    }
}

impl Session {
    /// Resolve the definition of the symbol at a position
    pub async fn definition(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<GotoDefinitionResponse>, SessionError> {
        let params = GotoDefinitionParams {
            text_document_position_params: self.document_position(path, position)?,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_for_documents(DEFINITION, &params, &[path]).await
    }
}

// ============================================================================
// textDocument/references
// ============================================================================

/// `textDocument/references`
pub struct References;

impl Feature for References {
    fn name(&self) -> &'static str {
        "references"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[REFERENCES]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).references = Some(ReferenceClientCapabilities {
            dynamic_registration: Some(false),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if provider_enabled(&capabilities.references_provider) {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: REFERENCES,
            })
        }
    }
}

impl Session {
    /// Find all references to the symbol at a position
    pub async fn references(
        &self,
        path: &Path,
        position: Position,
        include_declaration: bool,
    ) -> Result<Option<Vec<Location>>, SessionError> {
        let params = ReferenceParams {
            text_document_position: self.document_position(path, position)?,
            context: ReferenceContext {
                include_declaration,
            },
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_for_documents(REFERENCES, &params, &[path]).await
    }
}

// ============================================================================
// textDocument/hover
// ============================================================================

/// `textDocument/hover`
pub struct Hover;

impl Feature for Hover {
    fn name(&self) -> &'static str {
        "hover"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[HOVER]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).hover = Some(HoverClientCapabilities {
            dynamic_registration: Some(false),
            content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        match &capabilities.hover_provider {
            Some(HoverProviderCapability::Simple(true)) | Some(HoverProviderCapability::Options(_)) => {
                Ok(())
            }
            _ => Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: HOVER,
            }),
        }
    }
}

impl Session {
    /// Hover information for the symbol at a position
    pub async fn hover(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<HoverResult>, SessionError> {
        let params = HoverParams {
            text_document_position_params: self.document_position(path, position)?,
            work_done_progress_params: Default::default(),
        };
        self.request_for_documents(HOVER, &params, &[path]).await
    }
}

// ============================================================================
// textDocument/completion
// ============================================================================

/// `textDocument/completion`
pub struct Completion;

impl Feature for Completion {
    fn name(&self) -> &'static str {
        "completion"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[COMPLETION]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).completion = Some(CompletionClientCapabilities {
            dynamic_registration: Some(false),
            ..Default::default()
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if capabilities.completion_provider.is_some() {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: COMPLETION,
            })
        }
    }
}

impl Session {
    /// Completion proposals at a position. The list/array shape of the
    /// server's answer is preserved.
    pub async fn completion(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<CompletionResponse>, SessionError> {
        let params = CompletionParams {
            text_document_position: self.document_position(path, position)?,
            context: None,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_for_documents(COMPLETION, &params, &[path]).await
    }
}

// ============================================================================
// textDocument/rename
// ============================================================================

/// `textDocument/rename`
pub struct Rename;

impl Feature for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[RENAME]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).rename = Some(RenameClientCapabilities {
            dynamic_registration: Some(false),
            prepare_support: Some(false),
            prepare_support_default_behavior: None,
            honors_change_annotations: Some(false),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if provider_enabled(&capabilities.rename_provider) {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: RENAME,
            })
        }
    }
}

impl Session {
    /// Compute the workspace edit renaming the symbol at a position
    pub async fn rename(
        &self,
        path: &Path,
        position: Position,
        new_name: impl Into<String>,
    ) -> Result<Option<WorkspaceEdit>, SessionError> {
        let params = RenameParams {
            text_document_position: self.document_position(path, position)?,
            new_name: new_name.into(),
            work_done_progress_params: Default::default(),
        };
        self.request_for_documents(RENAME, &params, &[path]).await
    }
}

// ============================================================================
// workspace/symbol
// ============================================================================

/// `workspace/symbol`
pub struct WorkspaceSymbol;

impl Feature for WorkspaceSymbol {
    fn name(&self) -> &'static str {
        "workspaceSymbol"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::Workspace
    }

    fn methods(&self) -> &'static [&'static str] {
        &[WORKSPACE_SYMBOL]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        workspace(capabilities).symbol = Some(WorkspaceSymbolClientCapabilities {
            dynamic_registration: Some(false),
            ..Default::default()
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        if provider_enabled(&capabilities.workspace_symbol_provider) {
            Ok(())
        } else {
            Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: WORKSPACE_SYMBOL,
            })
        }
    }
}

impl Session {
    /// Search workspace symbols matching a query
    pub async fn workspace_symbols(
        &self,
        query: impl Into<String>,
    ) -> Result<Option<WorkspaceSymbolResponse>, SessionError> {
        let params = WorkspaceSymbolParams {
            query: query.into(),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_workspace(WORKSPACE_SYMBOL, &params).await
    }
}

// ============================================================================
// call hierarchy
// ============================================================================

/// `textDocument/prepareCallHierarchy`, `callHierarchy/incomingCalls`,
/// `callHierarchy/outgoingCalls`
pub struct CallHierarchy;

impl Feature for CallHierarchy {
    fn name(&self) -> &'static str {
        "callHierarchy"
    }

    fn section(&self) -> CapabilitySection {
        CapabilitySection::TextDocument
    }

    fn methods(&self) -> &'static [&'static str] {
        &[PREPARE_CALL_HIERARCHY, INCOMING_CALLS, OUTGOING_CALLS]
    }

    fn fill_client_capabilities(&self, capabilities: &mut ClientCapabilities) {
        text_document(capabilities).call_hierarchy = Some(CallHierarchyClientCapabilities {
            dynamic_registration: Some(false),
        });
    }

    fn check_server_capabilities(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityError> {
        match &capabilities.call_hierarchy_provider {
            Some(CallHierarchyServerCapability::Simple(true))
            | Some(CallHierarchyServerCapability::Options(_)) => Ok(()),
            _ => Err(CapabilityError::Unsupported {
                feature: self.name(),
                method: PREPARE_CALL_HIERARCHY,
            }),
        }
    }
}

impl Session {
    /// Prepare the call hierarchy for the symbol at a position
    pub async fn prepare_call_hierarchy(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<Vec<CallHierarchyItem>>, SessionError> {
        let params = CallHierarchyPrepareParams {
            text_document_position_params: self.document_position(path, position)?,
            work_done_progress_params: Default::default(),
        };
        self.request_for_documents(PREPARE_CALL_HIERARCHY, &params, &[path])
            .await
    }

    /// Callers of a prepared call-hierarchy item
    pub async fn incoming_calls(
        &self,
        item: CallHierarchyItem,
    ) -> Result<Option<Vec<CallHierarchyIncomingCall>>, SessionError> {
        let path = self.host_path(&item.uri)?;
        let params = CallHierarchyIncomingCallsParams {
            item,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_for_documents(INCOMING_CALLS, &params, &[path.as_path()])
            .await
    }

    /// Callees of a prepared call-hierarchy item
    pub async fn outgoing_calls(
        &self,
        item: CallHierarchyItem,
    ) -> Result<Option<Vec<CallHierarchyOutgoingCall>>, SessionError> {
        let path = self.host_path(&item.uri)?;
        let params = CallHierarchyOutgoingCallsParams {
            item,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        self.request_for_documents(OUTGOING_CALLS, &params, &[path.as_path()])
            .await
    }
}
