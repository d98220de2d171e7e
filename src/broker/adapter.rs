// ABOUTME: External client adapter owning the master's single outward connection
// ABOUTME: Receives relayed calls at the reply sink and emits replies back through the relay

//! External client adapter.
//!
//! The reply sink hands every relayed call to an [`ExternalClient`] together
//! with a single-use [`ReplyHandle`]. The adapter forwards the call over its
//! one outward connection and, when the answer comes back, consumes the handle
//! with [`ReplyHandle::emit_reply`]. The handle carries the return address, so
//! the adapter never needs to know which worker asked.
//!
//! [`TcpExternalClient`] is the built-in adapter: one TCP connection, one
//! envelope per line. Correlation ids are only unique per worker, so each call
//! leaves with an adapter-wide proxy id in `__cb` and the worker's own id is
//! put back on the reply.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{CORRELATION_KEY, CorrelationId, Envelope, EnvelopeError, peek_correlation_id};
use super::frame::RoutedFrame;

/// Failure value sent to callers once the outward connection is gone.
pub const EXTERNAL_CLOSED: &str = "external connection closed";

/// Errors raised by external client adapters
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The outward connection could not be opened
    #[error("Failed to connect to external service at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The reply sink has shut down
    #[error("Reply sink closed")]
    SinkClosed,

    /// A failure envelope could not be encoded
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Single-use return path for one relayed call.
#[derive(Debug)]
pub struct ReplyHandle {
    route: Vec<String>,
    replies: mpsc::UnboundedSender<RoutedFrame>,
}

impl ReplyHandle {
    pub(crate) fn new(route: Vec<String>, replies: mpsc::UnboundedSender<RoutedFrame>) -> Self {
        Self { route, replies }
    }

    /// Push a raw reply envelope back into the relay.
    pub fn emit_reply(self, payload: impl Into<String>) -> Result<(), AdapterError> {
        let mut body = payload.into();
        let trimmed = body.trim_end_matches(['\n', '\r']).len();
        body.truncate(trimmed);

        self.replies
            .send(RoutedFrame::reply_along(self.route, body))
            .map_err(|_| AdapterError::SinkClosed)
    }

    /// Answer the call with a failure envelope.
    pub fn emit_failure(self, id: CorrelationId, error: Value) -> Result<(), AdapterError> {
        let line = Envelope::failure(id, error).to_line()?;
        self.emit_reply(line)
    }
}

/// The seam between the relay and the outside world.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Take one relayed call. `payload` is the raw envelope line.
    async fn on_call(&self, payload: String, reply: ReplyHandle);
}

/// A forwarded call: the worker's own id and where its answer goes.
#[derive(Debug)]
struct WaitingCall {
    original: CorrelationId,
    reply: ReplyHandle,
}

/// Keyed by proxy id
type Waiting = Arc<Mutex<HashMap<CorrelationId, WaitingCall>>>;

/// Adapter speaking newline-delimited envelopes over one TCP connection.
pub struct TcpExternalClient {
    address: String,
    outbound: mpsc::UnboundedSender<String>,
    waiting: Waiting,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpExternalClient {
    /// Open the outward connection.
    pub async fn connect(address: &str) -> Result<Self, AdapterError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| AdapterError::Connect {
                address: address.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();

        let waiting: Waiting = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(Self::writer_loop(
            BufWriter::new(write_half),
            outbound_rx,
            address.to_string(),
        ));
        let reader = tokio::spawn(Self::reader_loop(
            BufReader::new(read_half),
            Arc::clone(&waiting),
            Arc::clone(&connected),
            address.to_string(),
        ));

        info!(address = %address, "Connected to external service");

        Ok(Self {
            address: address.to_string(),
            outbound,
            waiting,
            connected,
            tasks: vec![writer, reader],
        })
    }

    /// Address of the external service
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// True while the outward connection is open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Calls forwarded but not yet answered
    pub async fn waiting_count(&self) -> usize {
        self.waiting.lock().await.len()
    }

    async fn writer_loop(
        mut writer: BufWriter<OwnedWriteHalf>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        address: String,
    ) {
        while let Some(line) = outbound_rx.recv().await {
            let result = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                warn!(address = %address, error = %e, "Write to external service failed");
                break;
            }
        }
        debug!(address = %address, "External writer loop ended");
    }

    async fn reader_loop(
        reader: BufReader<OwnedReadHalf>,
        waiting: Waiting,
        connected: Arc<AtomicBool>,
        address: String,
    ) {
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let Some(proxy) = peek_correlation_id(&line) else {
                        warn!(address = %address, "External reply without correlation id, dropping");
                        continue;
                    };
                    let Some(call) = waiting.lock().await.remove(&proxy) else {
                        warn!(proxy_id = %proxy, "External reply has no waiting call, dropping");
                        continue;
                    };
                    let Some((_, restored)) = rewrite_correlation_id(&line, &call.original) else {
                        warn!(proxy_id = %proxy, "External reply is not an envelope object");
                        answer_failure(call, json!("malformed external reply"));
                        continue;
                    };
                    if call.reply.emit_reply(restored).is_err() {
                        debug!(correlation_id = %call.original, "Reply sink closed, reply lost");
                    }
                }
                Ok(None) => {
                    warn!(address = %address, "External service closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Read from external service failed");
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        let stranded: Vec<_> = waiting.lock().await.drain().collect();
        if !stranded.is_empty() {
            warn!(address = %address, count = stranded.len(), "Failing calls after external disconnect");
        }
        for (_, call) in stranded {
            answer_failure(call, json!(EXTERNAL_CLOSED));
        }
    }
}

impl Drop for TcpExternalClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl ExternalClient for TcpExternalClient {
    async fn on_call(&self, payload: String, reply: ReplyHandle) {
        let proxy = CorrelationId::new();
        let Some((original, line)) = rewrite_correlation_id(&payload, &proxy) else {
            warn!(address = %self.address, "Relayed call without correlation id, dropping");
            return;
        };
        let call = WaitingCall { original, reply };

        if !self.is_connected() {
            answer_failure(call, json!(EXTERNAL_CLOSED));
            return;
        }

        debug!(correlation_id = %call.original, proxy_id = %proxy, "Forwarding call");
        self.waiting.lock().await.insert(proxy.clone(), call);

        // The reader clears the flag before draining, so a stranded call is caught here.
        if !self.is_connected() || self.outbound.send(line).is_err() {
            if let Some(call) = self.waiting.lock().await.remove(&proxy) {
                answer_failure(call, json!(EXTERNAL_CLOSED));
            }
        }
    }
}

/// Swap the `__cb` of an envelope line for `id`, returning the old id and the new line.
fn rewrite_correlation_id(line: &str, id: &CorrelationId) -> Option<(CorrelationId, String)> {
    let mut envelope: Value = serde_json::from_str(line).ok()?;
    let fields = envelope.as_object_mut()?;
    let previous = match fields.get(CORRELATION_KEY)? {
        Value::String(previous) => CorrelationId::from(previous.as_str()),
        _ => return None,
    };
    fields.insert(CORRELATION_KEY.to_string(), Value::String(id.as_str().to_string()));
    let rewritten = serde_json::to_string(&envelope).ok()?;
    Some((previous, rewritten))
}

fn answer_failure(call: WaitingCall, error: Value) {
    let id = call.original.clone();
    if let Err(e) = call.reply.emit_failure(call.original, error) {
        debug!(correlation_id = %id, error = %e, "Could not answer call");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn handle() -> (ReplyHandle, mpsc::UnboundedReceiver<RoutedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyHandle::new(vec!["conn-1".to_string()], tx), rx)
    }

    /// External service that answers `{"__cb":id,"msg":m}` with `{"__cb":id,"msg":{"seen":m}}`.
    async fn spawn_service() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let call = Envelope::from_line(&line).unwrap();
                let msg = call.body.into_result().unwrap();
                let reply = Envelope::reply(call.id, json!({"seen": msg})).to_line().unwrap();
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        (address, task)
    }

    #[test]
    fn test_emit_reply_keeps_route_and_strips_newline() {
        let (reply, mut rx) = handle();
        reply.emit_reply("{\"__cb\":\"a\",\"msg\":1}\n").unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.route, vec!["conn-1".to_string()]);
        assert_eq!(frame.body, r#"{"__cb":"a","msg":1}"#);
    }

    #[test]
    fn test_emit_reply_after_sink_closed() {
        let (reply, rx) = handle();
        drop(rx);
        assert!(matches!(reply.emit_reply("{}"), Err(AdapterError::SinkClosed)));
    }

    #[tokio::test]
    async fn test_tcp_client_matches_reply_to_handle() {
        let (address, _service) = spawn_service().await;
        let client = TcpExternalClient::connect(&address).await.unwrap();

        let (reply, mut rx) = handle();
        client
            .on_call(r#"{"__cb":"abc123","msg":{"op":"ping"}}"#.to_string(), reply)
            .await;

        let frame = rx.recv().await.unwrap();
        let envelope = Envelope::from_line(&frame.body).unwrap();
        assert_eq!(envelope.id, CorrelationId::from("abc123"));
        assert_eq!(envelope.body.into_result(), Ok(json!({"seen": {"op": "ping"}})));
        assert_eq!(client.waiting_count().await, 0);
    }

    #[test]
    fn test_rewrite_correlation_id_keeps_payload() {
        let proxy = CorrelationId::from("proxy-1");
        let (original, line) =
            rewrite_correlation_id(r#"{"__cb":"abc123","msg":{"op":"ping"}}"#, &proxy).unwrap();

        assert_eq!(original, CorrelationId::from("abc123"));
        let envelope = Envelope::from_line(&line).unwrap();
        assert_eq!(envelope.id, proxy);
        assert_eq!(envelope.body.into_result(), Ok(json!({"op": "ping"})));

        assert!(rewrite_correlation_id(r#"{"msg":1}"#, &proxy).is_none());
        assert!(rewrite_correlation_id(r#"{"__cb":7,"msg":1}"#, &proxy).is_none());
        assert!(rewrite_correlation_id("[1,2]", &proxy).is_none());
    }

    #[tokio::test]
    async fn test_same_id_from_two_workers_stays_separate() {
        let (address, _service) = spawn_service().await;
        let client = TcpExternalClient::connect(&address).await.unwrap();

        let (first, mut first_rx) = handle();
        let (tx, mut second_rx) = mpsc::unbounded_channel();
        let second = ReplyHandle::new(vec!["conn-2".to_string()], tx);

        client
            .on_call(r#"{"__cb":"abc123","msg":"first"}"#.to_string(), first)
            .await;
        client
            .on_call(r#"{"__cb":"abc123","msg":"second"}"#.to_string(), second)
            .await;

        let first = Envelope::from_line(&first_rx.recv().await.unwrap().body).unwrap();
        let second = Envelope::from_line(&second_rx.recv().await.unwrap().body).unwrap();
        assert_eq!(first.id, CorrelationId::from("abc123"));
        assert_eq!(first.body.into_result(), Ok(json!({"seen": "first"})));
        assert_eq!(second.id, CorrelationId::from("abc123"));
        assert_eq!(second.body.into_result(), Ok(json!({"seen": "second"})));
        assert_eq!(client.waiting_count().await, 0);
    }

    #[tokio::test]
    async fn test_tcp_client_fails_waiting_calls_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let _service = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = close_rx.await;
            drop(stream);
        });

        let client = TcpExternalClient::connect(&address).await.unwrap();
        let (reply, mut rx) = handle();
        client.on_call(r#"{"__cb":"w","msg":1}"#.to_string(), reply).await;
        close_tx.send(()).unwrap();

        let frame = rx.recv().await.unwrap();
        let envelope = Envelope::from_line(&frame.body).unwrap();
        assert_eq!(envelope.body.into_result(), Err(json!(EXTERNAL_CLOSED)));
        assert!(!client.is_connected());

        // Calls after the disconnect are answered at once.
        let (reply, mut rx) = handle();
        client.on_call(r#"{"__cb":"late","msg":1}"#.to_string(), reply).await;
        let frame = rx.recv().await.unwrap();
        assert!(Envelope::from_line(&frame.body).unwrap().is_failure());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpExternalClient::connect(&address).await;
        assert!(matches!(result, Err(AdapterError::Connect { .. })));
    }
}
