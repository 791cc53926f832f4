//! Worker transports.
//!
//! A [`WorkerLauncher`] starts one worker instance and hands back a
//! [`WorkerLink`]: line-oriented channels plus a kill switch. The client never
//! touches processes directly, so tests can run workers in-process.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::RpcError;
use crate::process::configure_piped_command;

/// Connection to one running worker instance.
pub struct WorkerLink {
    /// Lines to deliver to the worker (without trailing newline)
    pub outbound: mpsc::UnboundedSender<String>,
    /// Lines produced by the worker; closes when the worker is gone
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Send, or drop, to stop the worker
    pub kill: oneshot::Sender<()>,
}

/// Starts worker instances for a [`super::WorkerClient`].
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerLink, RpcError>;
}

/// Runs the worker as a child process speaking JSON lines over stdin/stdout.
///
/// The child's stderr is inherited so its logs end up next to ours.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerLink, RpcError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        configure_piped_command(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::Launch(format!("{}: {}", self.program.display(), e)))?;
        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Launch("worker stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Launch("worker stdout was not captured".to_string()))?;
        info!(pid = ?pid, program = %self.program.display(), "Worker process started");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    debug!("Worker stdin closed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = &mut kill_rx => {
                        if let Err(e) = child.kill().await {
                            warn!(pid = ?pid, "Failed to kill worker: {}", e);
                        }
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if in_tx.send(line).is_err() {
                                let _ = child.kill().await;
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(pid = ?pid, "Failed to read from worker: {}", e);
                            break;
                        }
                    },
                }
            }

            match child.wait().await {
                Ok(status) => info!(pid = ?pid, %status, "Worker process exited"),
                Err(e) => warn!(pid = ?pid, "Failed to reap worker: {}", e),
            }
            // in_tx drops here, which tells the client the worker is gone.
        });

        Ok(WorkerLink {
            outbound: out_tx,
            inbound: in_rx,
            kill: kill_tx,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_process_link_round_trip_and_kill() {
        let launcher = ProcessLauncher::new("sh", ["-c", "while read line; do echo \"got $line\"; done"]);
        let mut link = launcher.launch().await.unwrap();

        link.outbound.send("hello".to_string()).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("got hello"));

        link.kill.send(()).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_exit_closes_inbound() {
        let launcher = ProcessLauncher::new("sh", ["-c", "exit 3"]);
        let mut link = launcher.launch().await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let launcher = ProcessLauncher::new("/definitely/not/a/worker", Vec::<String>::new());
        assert!(matches!(launcher.launch().await, Err(RpcError::Launch(_))));
    }
}
