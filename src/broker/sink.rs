// ABOUTME: Reply sink of the broker relay, connected to the back address
// ABOUTME: Feeds calls to the external client adapter, or echoes them back when none is configured

use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::BrokerError;
use super::adapter::{ExternalClient, ReplyHandle};
use super::frame::RoutedFrame;

/// Where relayed calls are consumed and replies produced.
pub struct ReplySink {
    adapter: Option<Arc<dyn ExternalClient>>,
}

impl ReplySink {
    /// Sink backed by `adapter`, or a loop-back sink when `None`.
    #[must_use]
    pub fn new(adapter: Option<Arc<dyn ExternalClient>>) -> Self {
        Self { adapter }
    }

    /// True when calls are echoed back rather than sent out
    #[must_use]
    pub const fn is_loop_back(&self) -> bool {
        self.adapter.is_none()
    }

    /// Connect to back dispatch at `path` and start serving.
    pub async fn connect(self, path: &Path) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let stream = UnixStream::connect(path).await?;
        info!(
            socket = %path.display(),
            loop_back = self.is_loop_back(),
            "Reply sink connected to back dispatch"
        );
        Ok(self.spawn(stream))
    }

    /// Serve an already-connected back stream.
    pub(crate) fn spawn(self, stream: UnixStream) -> Vec<JoinHandle<()>> {
        let (read_half, write_half) = stream.into_split();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_replies(BufWriter::new(write_half), replies_rx));
        let reader = tokio::spawn(self.read_calls(BufReader::new(read_half), replies_tx));
        vec![reader, writer]
    }

    async fn read_calls(
        self,
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        replies: mpsc::UnboundedSender<RoutedFrame>,
    ) {
        let mut lines = reader.lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Back dispatch closed the sink connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Read from back dispatch failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frame = match RoutedFrame::from_line(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Malformed call frame, dropping");
                    continue;
                }
            };

            match &self.adapter {
                Some(adapter) => {
                    let reply = ReplyHandle::new(frame.route, replies.clone());
                    adapter.on_call(frame.body, reply).await;
                }
                None => {
                    // Loop-back: the call is its own reply.
                    if replies.send(frame).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn write_replies(
    mut writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
    mut replies: mpsc::UnboundedReceiver<RoutedFrame>,
) {
    while let Some(frame) = replies.recv().await {
        let line = match frame.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Could not encode reply frame");
                continue;
            }
        };
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "Write to back dispatch failed");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    async fn send_frame(stream: &mut UnixStream, frame: &RoutedFrame) {
        stream.write_all(frame.to_line().unwrap().as_bytes()).await.unwrap();
    }

    async fn read_frame(stream: &mut UnixStream) -> RoutedFrame {
        let mut lines = BufReader::new(stream).lines();
        RoutedFrame::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_loop_back_echoes_frame_unchanged() {
        let (sink_side, mut dispatch_side) = UnixStream::pair().unwrap();
        let _tasks = ReplySink::new(None).spawn(sink_side);

        let call = RoutedFrame::reply_along(vec!["conn".to_string()], r#"{"__cb":"a","msg":1}"#);
        send_frame(&mut dispatch_side, &call).await;

        assert_eq!(read_frame(&mut dispatch_side).await, call);
    }

    struct Uppercase;

    #[async_trait]
    impl ExternalClient for Uppercase {
        async fn on_call(&self, payload: String, reply: ReplyHandle) {
            reply.emit_reply(payload.to_uppercase()).unwrap();
        }
    }

    #[tokio::test]
    async fn test_adapter_reply_keeps_route() {
        let (sink_side, mut dispatch_side) = UnixStream::pair().unwrap();
        let _tasks = ReplySink::new(Some(Arc::new(Uppercase))).spawn(sink_side);

        let call = RoutedFrame::reply_along(vec!["conn".to_string()], "hello");
        send_frame(&mut dispatch_side, &call).await;

        let reply = read_frame(&mut dispatch_side).await;
        assert_eq!(reply.route, vec!["conn".to_string()]);
        assert_eq!(reply.body, "HELLO");
    }
}
