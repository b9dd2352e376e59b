//! Process management layer
//!
//! Defines the launcher contract the engine consumes to obtain connected
//! server transports, and the default local child-process implementation.
//! Container launchers implement the same trait externally, supplying a
//! path translator when the server's filesystem view differs from the
//! host's.

use crate::io::transport::{StdioTransport, Transport};
use crate::uri::{DirectTranslator, PathTranslator};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Error types for server launching
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} not available on spawned process")]
    MissingStdio(&'static str),

    #[error("launcher has no server available: {0}")]
    Unavailable(String),
}

/// Contract for starting language-server instances.
///
/// `launch` is called once per pool slot and must hand back a connected
/// duplex transport together with a handle that can force-terminate the
/// instance.
#[async_trait]
pub trait Launcher: Send + Sync {
    type Transport: Transport + 'static;
    type Handle: ServerHandle + 'static;

    /// Start one server instance
    async fn launch(&self) -> Result<(Self::Transport, Self::Handle), LaunchError>;

    /// Path translation between host paths and server URIs
    fn translator(&self) -> Arc<dyn PathTranslator> {
        Arc::new(DirectTranslator)
    }
}

/// Handle to a launched server instance
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Idempotent forced termination
    async fn kill(&mut self) -> Result<(), LaunchError>;

    /// Synchronous best-effort kill for drop paths
    fn start_kill(&mut self);

    /// Process id, if the instance is a local process
    fn id(&self) -> Option<u32> {
        None
    }
}

// ============================================================================
// Child Process Launcher
// ============================================================================

type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Launches language servers as local child processes with piped stdio
pub struct ChildProcessLauncher {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the spawned process
    cwd: Option<PathBuf>,

    /// Extra environment variables
    envs: Vec<(String, String)>,

    /// Handler invoked for each stderr line
    stderr_handler: Option<StderrHandler>,
}

impl ChildProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            stderr_handler: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Install a handler for stderr lines of every launched instance
    pub fn on_stderr_line<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    fn spawn_stderr_monitor(
        stderr: tokio::process::ChildStderr,
        handler: Option<StderrHandler>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessLauncher: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim().to_string();
                        if line_content.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(line_content),
                            None => debug!("server stderr: {}", line_content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Launcher for ChildProcessLauncher {
    type Transport = StdioTransport;
    type Handle = ChildHandle;

    async fn launch(&self) -> Result<(Self::Transport, Self::Handle), LaunchError> {
        info!("Starting server process: {} {:?}", self.command, self.args);

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        info!("Server process started with PID: {:?}", child.id());

        let stdin = child.stdin.take().ok_or(LaunchError::MissingStdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(LaunchError::MissingStdio("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(LaunchError::MissingStdio("stderr"))?;

        let stderr_task = Self::spawn_stderr_monitor(stderr, self.stderr_handler.clone());

        Ok((
            StdioTransport::new(stdin, stdout),
            ChildHandle {
                child,
                stderr_task: Some(stderr_task),
            },
        ))
    }
}

/// Handle to a launched child process
pub struct ChildHandle {
    child: Child,
    stderr_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ServerHandle for ChildHandle {
    async fn kill(&mut self) -> Result<(), LaunchError> {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        match self.child.try_wait()? {
            Some(status) => {
                debug!("Server process already exited with status: {}", status);
            }
            None => {
                info!("Killing server process with PID: {:?}", self.child.id());
                self.child.kill().await?;
                self.child.wait().await?;
            }
        }

        Ok(())
    }

    fn start_kill(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        let _ = self.child.start_kill();
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_child_launcher_lifecycle() {
        let launcher = ChildProcessLauncher::new("cat");
        let (transport, mut handle) = launcher.launch().await.unwrap();

        assert!(transport.is_connected());
        assert!(handle.id().is_some());

        handle.kill().await.unwrap();
        // kill is idempotent
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let launcher = ChildProcessLauncher::new("definitely-not-a-real-binary-4729");
        match launcher.launch().await {
            Err(LaunchError::Spawn { command, .. }) => {
                assert_eq!(command, "definitely-not-a-real-binary-4729");
            }
            other => panic!("Expected spawn failure, got: {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_stderr_monitoring() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&lines);

        let launcher = ChildProcessLauncher::new("sh")
            .arg("-c")
            .arg("echo 'error message' >&2; sleep 1")
            .on_stderr_line(move |line| {
                lines_clone.lock().unwrap().push(line);
            });

        let (_transport, mut handle) = launcher.launch().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.kill().await.unwrap();

        let lines = lines.lock().unwrap();
        assert!(!lines.is_empty());
        assert_eq!(lines[0], "error message");
    }
}
