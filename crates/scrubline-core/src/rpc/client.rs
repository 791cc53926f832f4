//! Worker RPC client.
//!
//! At most one live worker per client. Every (re)start bumps a generation
//! number; exit notifications from older generations are ignored, which is how
//! an intentional `terminate` is told apart from a crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{RpcError, RpcRequest, RpcResponse, WorkerLauncher, WorkerLink, INIT_MESSAGE};
use crate::MessageId;

/// Client tuning
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerClientConfig {
    /// Per-call reply deadline
    pub request_timeout: Duration,
    /// Relaunch after an unexpected exit
    pub auto_restart: bool,
    /// Consecutive restarts allowed before giving up
    pub max_restarts: u32,
    /// Pause before each restart
    pub restart_delay: Duration,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            auto_restart: true,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
        }
    }
}

type ReplySender = oneshot::Sender<Result<Value, RpcError>>;

struct LiveWorker {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct ClientState {
    worker: Option<LiveWorker>,
    pending: HashMap<MessageId, ReplySender>,
    handshake: Option<Value>,
    generation: u64,
    /// Generation whose exit already has a restart queued
    restart_queued: Option<u64>,
}

struct ClientInner {
    launcher: Arc<dyn WorkerLauncher>,
    config: WorkerClientConfig,
    next_id: AtomicU64,
    restart_count: AtomicU32,
    state: Mutex<ClientState>,
}

/// Request/response client for a supervised worker.
///
/// Clones share the same worker. Dropping the last clone stops the worker.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: WorkerClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                launcher,
                config,
                next_id: AtomicU64::new(1),
                restart_count: AtomicU32::new(0),
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    pub fn config(&self) -> &WorkerClientConfig {
        &self.inner.config
    }

    /// Launches the worker, replacing any running instance.
    ///
    /// A `handshake` payload is remembered, sent as an `"init"` message now and
    /// replayed after every automatic restart. A launch failure leaves the
    /// client without a worker; it is not retried from here.
    pub async fn init(&self, handshake: Option<Value>) -> Result<(), RpcError> {
        let generation = {
            let mut state = self.inner.lock();
            state.handshake = handshake;
            state.generation += 1;
            state.generation
        };
        ClientInner::start(&self.inner, generation).await
    }

    /// Sends a request and waits for its reply.
    ///
    /// Fails with `NotRunning` without waiting if no worker is live. A timeout
    /// only drops the local bookkeeping; the worker may still finish the work.
    pub async fn send_message<P: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &P,
    ) -> Result<Value, RpcError> {
        let payload = serde_json::to_value(payload)?;
        self.inner.request(kind, payload).await
    }

    /// [`WorkerClient::send_message`] with a typed reply.
    pub async fn call<P, R>(&self, kind: &str, payload: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = self.send_message(kind, payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Stops the worker on purpose. Pending calls fail with `Terminated` and no
    /// restart is scheduled.
    pub fn terminate(&self, reset_counter: bool) {
        let (worker, pending) = {
            let mut state = self.inner.lock();
            state.generation += 1;
            (state.worker.take(), std::mem::take(&mut state.pending))
        };

        if let Some(worker) = worker {
            info!(generation = worker.generation, "Terminating worker");
            let _ = worker.kill.send(());
        }
        for (_, reply) in pending {
            let _ = reply.send(Err(RpcError::Terminated));
        }
        if reset_counter {
            self.inner.restart_count.store(0, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().worker.is_some()
    }

    /// Requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Consecutive automatic restarts since the last successful reply
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }
}

impl ClientInner {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn start(inner: &Arc<ClientInner>, generation: u64) -> Result<(), RpcError> {
        let WorkerLink {
            outbound,
            inbound,
            kill,
        } = inner.launcher.launch().await?;

        let (replaced, stale, handshake) = {
            let mut state = inner.lock();
            if state.generation != generation {
                // terminate() or a newer init() won while we were launching
                drop(state);
                let _ = kill.send(());
                return Err(RpcError::Terminated);
            }
            let replaced = state.worker.replace(LiveWorker {
                generation,
                outbound,
                kill,
            });
            let stale = if replaced.is_some() {
                std::mem::take(&mut state.pending)
            } else {
                HashMap::new()
            };
            (replaced, stale, state.handshake.clone())
        };

        if let Some(old) = replaced {
            debug!(generation = old.generation, "Replacing running worker");
            let _ = old.kill.send(());
        }
        for (_, reply) in stale {
            let _ = reply.send(Err(RpcError::Terminated));
        }

        tokio::spawn(read_loop(Arc::downgrade(inner), generation, inbound));
        info!(generation, "Worker ready");

        if let Some(payload) = handshake {
            if let Err(e) = inner.request(INIT_MESSAGE, payload).await {
                warn!(generation, "Worker handshake failed: {}", e);
                inner.discard(generation);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops the worker of `generation` if it is still the live one.
    fn discard(&self, generation: u64) {
        let (worker, pending) = {
            let mut state = self.lock();
            match &state.worker {
                Some(worker) if worker.generation == generation => {}
                _ => return,
            }
            (state.worker.take(), std::mem::take(&mut state.pending))
        };

        if let Some(worker) = worker {
            let _ = worker.kill.send(());
        }
        for (_, reply) in pending {
            let _ = reply.send(Err(RpcError::Terminated));
        }
    }

    async fn request(&self, kind: &str, payload: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&RpcRequest {
            id,
            kind: kind.to_string(),
            payload,
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            let outbound = match &state.worker {
                Some(worker) => worker.outbound.clone(),
                None => return Err(RpcError::NotRunning),
            };
            state.pending.insert(id, tx);
            if outbound.send(line).is_err() {
                state.pending.remove(&id);
                return Err(RpcError::NotRunning);
            }
        }

        let _guard = PendingGuard { inner: self, id };
        let after = self.config.request_timeout;
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ProcessCrashed),
            Err(_) => {
                warn!(id, kind, "Worker request timed out");
                Err(RpcError::Timeout { id, after })
            }
        }
    }

    fn dispatch(&self, line: &str) {
        let response: RpcResponse = match serde_json::from_str(line) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring malformed worker message: {}", e);
                return;
            }
        };

        let id = response.id;
        let Some(reply) = self.lock().pending.remove(&id) else {
            debug!(id, "Ignoring reply for unknown or expired request");
            return;
        };

        let result = response.into_result();
        if result.is_ok() {
            self.restart_count.store(0, Ordering::SeqCst);
        }
        let _ = reply.send(result);
    }

    fn on_worker_exit(inner: &Arc<ClientInner>, generation: u64) {
        let pending = {
            let mut state = inner.lock();
            match &state.worker {
                Some(worker) if worker.generation == generation => {}
                // terminated on purpose, or already replaced
                _ => return,
            }
            state.worker = None;
            std::mem::take(&mut state.pending)
        };

        warn!(generation, pending = pending.len(), "Worker exited unexpectedly");
        ClientInner::schedule_restart(inner, generation);
        for (_, reply) in pending {
            let _ = reply.send(Err(RpcError::ProcessCrashed));
        }
    }

    fn schedule_restart(inner: &Arc<ClientInner>, generation: u64) {
        if !inner.config.auto_restart {
            return;
        }
        {
            let mut state = inner.lock();
            if state.generation != generation || state.restart_queued == Some(generation) {
                return;
            }
            state.restart_queued = Some(generation);
        }
        let attempts = inner.restart_count.load(Ordering::SeqCst);
        if attempts >= inner.config.max_restarts {
            error!(
                attempts,
                "Worker restart limit reached, giving up on automatic recovery"
            );
            return;
        }
        let attempt = attempts + 1;
        inner.restart_count.store(attempt, Ordering::SeqCst);

        let weak = Arc::downgrade(inner);
        let delay = inner.config.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let next = {
                let mut state = inner.lock();
                if state.generation != generation || state.worker.is_some() {
                    return;
                }
                state.generation += 1;
                state.generation
            };

            info!(attempt, "Restarting worker");
            if let Err(e) = ClientInner::start(&inner, next).await {
                warn!(attempt, "Worker restart failed: {}", e);
                ClientInner::schedule_restart(&inner, next);
            }
        });
    }
}

async fn read_loop(
    inner: Weak<ClientInner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(&line);
    }
    if let Some(inner) = inner.upgrade() {
        ClientInner::on_worker_exit(&inner, generation);
    }
}

/// Removes a pending entry when its call stops waiting (timeout or drop).
struct PendingGuard<'a> {
    inner: &'a ClientInner,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.id);
    }
}
