//! Standard I/O bindings
//!
//! [`Transport::stdio`] serves the agent side: the process talks to its
//! parent over its own stdin/stdout. [`Transport::spawn`] serves the client
//! side: it starts the agent as a subprocess and owns the child.

use super::framed::{FramedReader, FramedWriter};
use super::{MessageWriter, Transport};
use crate::error::RpcError;
use crate::protocol::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// How long a child gets to exit after its stdin closes
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

impl Transport {
    /// Bind this process's stdin and stdout
    pub fn stdio(max_line_bytes: usize) -> Self {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout(), max_line_bytes)
    }

    /// Spawn a subprocess and bind its stdin/stdout
    pub fn spawn(
        command: impl AsRef<str>,
        args: &[impl AsRef<str>],
        max_line_bytes: usize,
    ) -> Result<Self, RpcError> {
        Self::spawn_with_env(command, args, &HashMap::new(), max_line_bytes)
    }

    /// Spawn with environment variables
    pub fn spawn_with_env(
        command: impl AsRef<str>,
        args: &[impl AsRef<str>],
        env: &HashMap<String, String>,
        max_line_bytes: usize,
    ) -> Result<Self, RpcError> {
        let mut cmd = Command::new(command.as_ref());

        cmd.args(args.iter().map(|a| a.as_ref()))
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            RpcError::transport(format!("failed to spawn '{}': {}", command.as_ref(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::transport("failed to get child stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::transport("failed to get child stdout handle"))?;

        debug!(command = command.as_ref(), pid = ?child.id(), "spawned transport subprocess");

        Ok(Self::new(
            Box::new(FramedReader::new(stdout, max_line_bytes)),
            Box::new(ChildWriter {
                inner: Some(FramedWriter::new(stdin)),
                child: Some(child),
            }),
        ))
    }
}

/// Writer half that owns the child process.
///
/// Closing it closes the child's stdin, then waits for the child to exit and
/// kills it if it does not.
pub struct ChildWriter {
    inner: Option<FramedWriter<ChildStdin>>,
    child: Option<Child>,
}

#[async_trait]
impl MessageWriter for ChildWriter {
    async fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        match self.inner.as_mut() {
            Some(inner) => inner.send(message).await,
            None => Err(RpcError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        // Shutting down a `ChildStdin` does not close the pipe; only dropping
        // it delivers EOF to the child.
        let result = match self.inner.take() {
            Some(mut inner) => inner.close().await,
            None => Ok(()),
        };

        if let Some(mut child) = self.child.take() {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| RpcError::transport(e.to_string()))?;
                    debug!(?status, "transport subprocess exited");
                }
                _ = tokio::time::sleep(CHILD_EXIT_GRACE) => {
                    warn!("transport subprocess did not exit, killing it");
                    child.kill().await.ok();
                }
            }
        }

        result
    }
}

impl Drop for ChildWriter {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
