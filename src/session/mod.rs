//! Session lifecycle and caller-facing surface
//!
//! A session drives initialize -> initialized -> (serve) -> shutdown ->
//! exit across a pool of equivalent bindings and exposes only the
//! operations of features whose validators passed at handshake.

pub mod builder;
pub(crate) mod documents;
mod session;

pub use builder::SessionBuilder;
pub use session::{DocumentsGuard, Session, SessionError, SessionState};
