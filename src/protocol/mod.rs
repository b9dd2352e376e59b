//! Protocol engine
//!
//! Correlates out-of-order responses with outstanding requests, routes
//! server-initiated traffic to registered handlers, and owns the write
//! queue, reader loop and lifecycle state of each connected server.

pub mod binding;
pub mod dispatch;
pub mod pending;
pub mod registry;

pub use binding::{Binding, BindingOptions, BindingState, SubmitMode, WriteJob};
pub use pending::{PendingTable, RawOutcome, RequestError};
pub use registry::{HandlerError, HandlerRegistry, RegistryError, SealedRegistry};
