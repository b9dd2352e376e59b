//! I/O layer: transport abstraction, LSP message framing, and the
//! launcher contract for starting server processes.

pub mod framing;
pub mod process;
pub mod transport;

pub use framing::{FrameCodec, FramingError, MAX_MESSAGE_SIZE};
pub use process::{ChildProcessLauncher, LaunchError, Launcher, ServerHandle};
pub use transport::{MockTransport, StdioTransport, Transport};
