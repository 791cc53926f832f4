//! Worker RPC Module
//!
//! Request/response messaging with a long-lived helper process over
//! newline-delimited JSON. The client side correlates replies by id, applies
//! per-call timeouts and restarts a crashed worker a bounded number of times;
//! the server side is a small loop a worker binary runs over stdin/stdout.

mod client;
mod server;
mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::{WorkerClient, WorkerClientConfig};
pub use server::{serve, WorkerHandler};
pub use transport::{ProcessLauncher, WorkerLauncher, WorkerLink};

use crate::{ErrorCategory, MessageId};

/// Message type sent on (re)start when a handshake payload is configured
pub const INIT_MESSAGE: &str = "init";

/// `{"id":..,"type":..,"payload":..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `{"id":..,"result":{"success":..,"data"?:..,"error"?:..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: MessageId,
    pub result: RpcOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: MessageId, data: serde_json::Value) -> Self {
        Self {
            id,
            result: RpcOutcome {
                success: true,
                data: Some(data),
                error: None,
            },
        }
    }

    pub fn err(id: MessageId, error: impl Into<String>) -> Self {
        Self {
            id,
            result: RpcOutcome {
                success: false,
                data: None,
                error: Some(error.into()),
            },
        }
    }

    /// Converts the envelope into the caller-facing result.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        if self.result.success {
            Ok(self.result.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(RpcError::Remote(
                self.result
                    .error
                    .unwrap_or_else(|| "Unknown worker error".to_string()),
            ))
        }
    }
}

/// RPC failures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    #[error("Worker is not running")]
    NotRunning,

    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: MessageId, after: Duration },

    #[error("Worker process crashed")]
    ProcessCrashed,

    #[error("Worker was terminated")]
    Terminated,

    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker error: {0}")]
    Remote(String),
}

impl RpcError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RpcError::Timeout { .. } => ErrorCategory::Timeout,
            RpcError::ProcessCrashed | RpcError::NotRunning => ErrorCategory::ProcessCrash,
            RpcError::Launch(_) => ErrorCategory::Configuration,
            RpcError::Terminated | RpcError::Serialization(_) | RpcError::Remote(_) => {
                ErrorCategory::Internal
            }
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}
