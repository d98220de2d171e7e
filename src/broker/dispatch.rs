// ABOUTME: Back dispatch of the broker relay, bound on the back address
// ABOUTME: Hands admitted frames to connected reply sinks and passes their replies to the front

//! Back dispatch.
//!
//! Frames arriving from the front intake are written, one JSON line each, to a
//! reply sink connected on the back address. With several sinks connected the
//! frames are spread round-robin. While no sink is connected, frames wait in a
//! backlog and are flushed to the first sink that arrives. Reply frames read
//! from any sink go straight back to the front intake.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::BrokerError;
use super::frame::RoutedFrame;
use super::front::bind_private;

struct SinkSlot {
    id: Uuid,
    frames: mpsc::UnboundedSender<RoutedFrame>,
}

#[derive(Default)]
struct DispatchState {
    sinks: Vec<SinkSlot>,
    next: usize,
    backlog: VecDeque<RoutedFrame>,
}

impl DispatchState {
    fn route(&mut self, mut frame: RoutedFrame) {
        loop {
            if self.sinks.is_empty() {
                self.backlog.push_back(frame);
                return;
            }

            let index = self.next % self.sinks.len();
            self.next = self.next.wrapping_add(1);

            match self.sinks[index].frames.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    let gone = self.sinks.remove(index);
                    debug!(sink = %gone.id, "Dropped closed sink from rotation");
                    frame = returned;
                }
            }
        }
    }

    fn attach(&mut self, id: Uuid, frames: mpsc::UnboundedSender<RoutedFrame>) {
        while let Some(frame) = self.backlog.pop_front() {
            if let Err(mpsc::error::SendError(returned)) = frames.send(frame) {
                self.backlog.push_front(returned);
                return;
            }
        }
        self.sinks.push(SinkSlot { id, frames });
    }

    fn detach(&mut self, id: Uuid) {
        self.sinks.retain(|slot| slot.id != id);
    }
}

/// Listener on the back address.
pub struct BackDispatch {
    listener: UnixListener,
    path: PathBuf,
    state: Arc<Mutex<DispatchState>>,
}

impl BackDispatch {
    /// Bind the back address, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self, BrokerError> {
        Ok(Self {
            listener: bind_private(path)?,
            path: path.to_path_buf(),
            state: Arc::new(Mutex::new(DispatchState::default())),
        })
    }

    /// Start forwarding `calls` to sinks and sink replies to `to_front`.
    pub(crate) fn spawn(
        self,
        calls: mpsc::UnboundedReceiver<RoutedFrame>,
        to_front: mpsc::UnboundedSender<RoutedFrame>,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        let forwarder = tokio::spawn(forward_calls(calls, Arc::clone(&self.state)));
        let acceptor = tokio::spawn(self.accept_loop(to_front, shutdown));
        vec![acceptor, forwarder]
    }

    async fn accept_loop(self, to_front: mpsc::UnboundedSender<RoutedFrame>, shutdown: Arc<AtomicBool>) {
        info!(socket = %self.path.display(), "Back dispatch accepting sinks");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("Back dispatch shutdown requested");
                break;
            }

            match tokio::time::timeout(Duration::from_secs(1), self.listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    let id = Uuid::new_v4();
                    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                    self.state.lock().await.attach(id, frames_tx);
                    info!(sink = %id, "Reply sink connected");

                    tokio::spawn(handle_sink(
                        stream,
                        id,
                        frames_rx,
                        to_front.clone(),
                        Arc::clone(&self.state),
                    ));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Back dispatch accept error");
                }
                Err(_) => {}
            }
        }

        info!("Back dispatch loop ended");
    }
}

async fn forward_calls(mut calls: mpsc::UnboundedReceiver<RoutedFrame>, state: Arc<Mutex<DispatchState>>) {
    while let Some(frame) = calls.recv().await {
        state.lock().await.route(frame);
    }
    debug!("Call channel closed");
}

/// Write frames to one sink and read its replies.
async fn handle_sink(
    stream: UnixStream,
    id: Uuid,
    mut frames: mpsc::UnboundedReceiver<RoutedFrame>,
    to_front: mpsc::UnboundedSender<RoutedFrame>,
    state: Arc<Mutex<DispatchState>>,
) {
    let (read_half, write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(frame) = frames.recv().await {
            let line = match frame.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!(sink = %id, error = %e, "Could not encode frame");
                    continue;
                }
            };
            let result = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = result {
                warn!(sink = %id, error = %e, "Write to reply sink failed");
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match RoutedFrame::from_line(&line) {
                    Ok(frame) => {
                        if to_front.send(frame).is_err() {
                            warn!(sink = %id, "Front intake is gone");
                            break;
                        }
                    }
                    Err(e) => warn!(sink = %id, error = %e, "Malformed reply frame, dropping"),
                }
            }
            Ok(None) => {
                info!(sink = %id, "Reply sink disconnected");
                break;
            }
            Err(e) => {
                warn!(sink = %id, error = %e, "Read from reply sink failed");
                break;
            }
        }
    }

    state.lock().await.detach(id);
    writer.abort();
}
