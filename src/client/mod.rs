// ABOUTME: Per-worker correlation client for calls through the master's broker
// ABOUTME: One Unix stream to the front address, many concurrent calls matched by "__cb"

//! Correlation client.
//!
//! Every worker process holds exactly one [`BrokerClient`], shared by reference
//! with each of its resources. A call gets a fresh [`CorrelationId`], a pending
//! entry, and one envelope line on the connection. The reader task resolves
//! the entry when the reply carrying that id comes back.
//!
//! ```text
//! call(payload) ──► PendingCalls.register(id) ──► writer ──► front address
//!                                                                 │
//! caller ◄── oneshot ◄── PendingCalls.dispatch(line) ◄── reader ◄─┘
//! ```

pub mod backoff;
pub mod pending;

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::envelope::{CorrelationId, Envelope};
use crate::config::BrokerConfig;
use backoff::ConnectBackoff;
pub use pending::{CallResult, DispatchOutcome, PendingCalls};

/// Why a call did not produce a payload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The remote side answered with an `error` envelope
    #[error("Remote failure: {0}")]
    Remote(Value),

    /// No reply arrived within the call timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The broker connection was lost before the reply arrived
    #[error("Broker connection lost")]
    Disconnected,

    /// The payload could not be encoded
    #[error("Failed to encode call: {0}")]
    Encode(String),

    /// The client was closed locally
    #[error("Client closed")]
    Closed,

    /// A call with the same correlation id is already pending
    #[error("Correlation id {0} is already pending")]
    DuplicateId(String),
}

/// Errors establishing the broker connection
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not reach the front address before the connect timeout
    #[error("Failed to connect to broker at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket path could not be resolved
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to the broker connection. Cheap to clone.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    identity: String,
    pending: Arc<PendingCalls>,
    outbound: mpsc::UnboundedSender<String>,
    call_timeout: Option<Duration>,
    disconnected: Arc<AtomicBool>,
    closed: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("identity", &self.inner.identity)
            .field("call_timeout", &self.inner.call_timeout)
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Connect to the front address at `path`, retrying until `connect_timeout`.
    pub async fn connect(path: &Path, config: &BrokerConfig) -> Result<Self, ClientError> {
        let mut backoff = ConnectBackoff::new(
            Duration::from_millis(25),
            Duration::from_millis(500),
            config.connect_timeout,
        );

        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            path = %path.display(),
                            attempt = backoff.attempts(),
                            error = %e,
                            "Broker not reachable yet, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ClientError::Connect {
                            path: path.display().to_string(),
                            source: e,
                        });
                    }
                },
            }
        };

        let client = Self::from_stream(stream, config.effective_call_timeout());
        info!(identity = %client.identity(), path = %path.display(), "Connected to broker");
        Ok(client)
    }

    /// Wrap an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: UnixStream, call_timeout: Option<Duration>) -> Self {
        let identity = Uuid::new_v4().to_string();
        let pending = Arc::new(PendingCalls::new());
        let disconnected = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (read_half, write_half) = stream.into_split();

        let writer = tokio::spawn(Self::writer_loop(
            BufWriter::new(write_half),
            outbound_rx,
            identity.clone(),
        ));
        let reader = tokio::spawn(Self::reader_loop(
            BufReader::new(read_half),
            Arc::clone(&pending),
            Arc::clone(&disconnected),
            identity.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                identity,
                pending,
                outbound,
                call_timeout,
                disconnected,
                closed: AtomicBool::new(false),
                tasks: vec![writer, reader],
            }),
        }
    }

    /// Issue a call and wait for its reply.
    pub async fn call(&self, payload: Value) -> CallResult {
        self.call_with_id(CorrelationId::new(), payload).await
    }

    /// Issue a call under a caller-chosen correlation id.
    pub async fn call_with_id(&self, id: CorrelationId, payload: Value) -> CallResult {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }

        let line = Envelope::call(id.clone(), payload)
            .to_line()
            .map_err(|e| CallError::Encode(e.to_string()))?;

        // Dropping this future (abort, select, timeout) drops the guard and the entry.
        let (reply_rx, _entry) = self.inner.pending.register(id.clone()).await?;

        // Checked after registering: close() and the reader set their flag before draining.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return Err(CallError::Disconnected);
        }

        if self.inner.outbound.send(line).is_err() {
            return Err(CallError::Disconnected);
        }

        debug!(correlation_id = %id, "Call sent");

        match self.inner.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CallError::Disconnected),
                Err(_) => {
                    warn!(
                        correlation_id = %id,
                        timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "Call timed out"
                    );
                    Err(CallError::Timeout(limit))
                }
            },
            None => reply_rx.await.unwrap_or(Err(CallError::Disconnected)),
        }
    }

    /// Issue a call and hand its outcome to `callback` exactly once.
    pub fn call_with<F>(&self, payload: Value, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            callback(client.call(payload).await);
        })
    }

    /// Stop issuing calls and fail everything still pending with `Closed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = self.inner.pending.fail_all(|| CallError::Closed).await;
        debug!(identity = %self.inner.identity, failed, "Client closed");
    }

    /// Number of calls waiting for a reply
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Whether the call with `id` is still waiting
    pub async fn is_pending(&self, id: &CorrelationId) -> bool {
        self.inner.pending.contains(id).await
    }

    /// Connection identity used in logs
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// True once the broker connection has been lost
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    async fn writer_loop(
        mut writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        identity: String,
    ) {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                warn!(identity = %identity, error = %e, "Write to broker failed");
                break;
            }
            if let Err(e) = writer.flush().await {
                warn!(identity = %identity, error = %e, "Flush to broker failed");
                break;
            }
        }
        debug!(identity = %identity, "Broker writer loop ended");
    }

    async fn reader_loop(
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        pending: Arc<PendingCalls>,
        disconnected: Arc<AtomicBool>,
        identity: String,
    ) {
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    pending.dispatch(&line).await;
                }
                Ok(None) => {
                    warn!(identity = %identity, "Broker closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Read from broker failed");
                    break;
                }
            }
        }

        disconnected.store(true, Ordering::SeqCst);
        let failed = pending.fail_all(|| CallError::Disconnected).await;
        if failed > 0 {
            warn!(identity = %identity, failed, "Failed pending calls after disconnect");
        }
    }
}
