//! File-resolver bridge to a host process.
//!
//! When the in-memory store lacks a path during transpilation, the sandbox
//! may ask its host for it over a duplex message channel. Requests carry a
//! correlation id; responses are matched back to pending futures. The
//! evaluation stage never uses this channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

pub mod protocol;

pub use protocol::{FileRequest, FileResponse, Method};

/// Bridge error types
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Host error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Async file lookups the transpilation stage may fall back to
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn is_file(&self, path: &str) -> Result<bool>;

    /// `Ok(None)` when the host does not have the file either
    async fn read_file(&self, path: &str) -> Result<Option<String>>;
}

/// Client half of the file-resolver protocol
pub struct HostBridge {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<DashMap<u64, oneshot::Sender<FileResponse>>>,
    next_id: AtomicU64,
}

impl HostBridge {
    /// Wire the bridge over an outgoing/incoming channel pair and start
    /// the response pump
    pub fn new(
        tx: mpsc::UnboundedSender<String>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let pending: Arc<DashMap<u64, oneshot::Sender<FileResponse>>> = Arc::new(DashMap::new());

        let pump_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let response: FileResponse = match serde_json::from_str(&raw) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!("Discarding malformed bridge response: {}", err);
                        continue;
                    }
                };
                match pump_pending.remove(&response.i) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response);
                    }
                    None => {
                        tracing::warn!("Unmatched bridge response id {}", response.i);
                    }
                }
            }
        });

        Self {
            tx,
            pending,
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: Method, path: &str) -> Result<FileResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = FileRequest {
            m: method,
            p: path.to_string(),
            i: id,
        };

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(id, waiter_tx);

        let raw = serde_json::to_string(&request)
            .map_err(|err| BridgeError::Protocol(err.to_string()))?;
        if self.tx.send(raw).is_err() {
            self.pending.remove(&id);
            return Err(BridgeError::ChannelClosed);
        }

        waiter_rx.await.map_err(|_| BridgeError::ChannelClosed)
    }
}

#[async_trait]
impl FileResolver for HostBridge {
    async fn is_file(&self, path: &str) -> Result<bool> {
        let response = self.request(Method::IsFile, path).await?;
        if let Some(message) = response.e {
            return Err(BridgeError::Host(message));
        }
        Ok(response.r.as_bool().unwrap_or(false))
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let response = self.request(Method::ReadFile, path).await?;
        if response.e.is_some() {
            // The host signals a miss as an error; the caller decides
            // whether that becomes ENOENT.
            return Ok(None);
        }
        Ok(response.r.as_str().map(str::to_string))
    }
}
