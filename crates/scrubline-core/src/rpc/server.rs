//! Worker-side request loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{RpcRequest, RpcResponse};

/// Handles one request type dispatched by [`serve`].
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    /// Returns the reply data, or an error message sent back to the caller.
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String>;
}

/// Serves requests from `reader` until EOF, writing replies to `writer`.
///
/// Requests are handled concurrently, so replies may leave in a different
/// order than requests arrived. Malformed lines are logged and skipped. Returns
/// once every in-flight reply has been written.
pub async fn serve<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> std::io::Result<()>
where
    H: WorkerHandler + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_string(&response)?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping malformed request: {}", e);
                continue;
            }
        };
        debug!(id = request.id, kind = %request.kind, "Request received");

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = match handler.handle(&request.kind, request.payload).await {
                Ok(data) => RpcResponse::ok(request.id, data),
                Err(e) => RpcResponse::err(request.id, e),
            };
            let _ = tx.send(response);
        });
    }

    drop(tx);
    writer_task.await.map_err(std::io::Error::other)?
}
