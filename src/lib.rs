//! Pooled Language Server Protocol client engine.
//!
//! This crate implements the protocol core of an LSP 3.17 client:
//!
//! - **Transport**: raw byte-chunk exchange with a server process
//! - **Framing**: `Content-Length` framed JSON message codec
//! - **JSON-RPC**: message classification, id space, error objects
//! - **Protocol**: request/response correlation, handler dispatch,
//!   per-server write queue and lifecycle state
//! - **Pool**: request routing across equivalent server processes
//! - **Capability**: feature modules composing client capabilities and
//!   validating server capabilities at handshake
//! - **Session**: scoped lifetime from `initialize` to `exit`, with
//!   reference-counted document synchronization
//!
//! A session is assembled from feature modules and started against a
//! [`Launcher`](io::Launcher):
//!
//! ```no_run
//! use lsp_conduit::capability::{GotoDefinition, TextDocumentSync};
//! use lsp_conduit::io::ChildProcessLauncher;
//! use lsp_conduit::session::SessionBuilder;
//! use lsp_types::Position;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = ChildProcessLauncher::new("rust-analyzer");
//! let session = SessionBuilder::new("/path/to/project")
//!     .with_language_id("rust")
//!     .with_feature(TextDocumentSync)
//!     .with_feature(GotoDefinition)
//!     .start(&launcher)
//!     .await?;
//!
//! let locations = session
//!     .definition("src/main.rs".as_ref(), Position::new(10, 4))
//!     .await?;
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod io;
pub mod jsonrpc;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod uri;

pub use capability::{CapabilityError, Feature};
pub use config::ConfigurationStore;
pub use io::{ChildProcessLauncher, Launcher, ServerHandle, Transport};
pub use protocol::{BindingState, RequestError};
pub use session::{Session, SessionBuilder, SessionError, SessionState};
