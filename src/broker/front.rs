// ABOUTME: Front intake of the broker relay, the address every worker connects to
// ABOUTME: Tags inbound lines with their connection and writes replies to that connection only

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::BrokerError;
use super::frame::{ConnectionId, RoutedFrame};

/// Live worker connections and the channel feeding each one's writer.
pub(crate) type Connections = Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<String>>>>;

/// Listener on the front address.
pub struct FrontIntake {
    listener: UnixListener,
    path: PathBuf,
    connections: Connections,
}

impl FrontIntake {
    /// Bind the front address, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self, BrokerError> {
        let listener = bind_private(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Shared view of the connection table
    pub(crate) fn connections(&self) -> Connections {
        Arc::clone(&self.connections)
    }

    /// Start accepting workers and routing replies.
    ///
    /// Admitted frames go to `to_dispatch`; reply frames arrive on `replies`.
    pub(crate) fn spawn(
        self,
        to_dispatch: mpsc::UnboundedSender<RoutedFrame>,
        replies: mpsc::UnboundedReceiver<RoutedFrame>,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        let router = tokio::spawn(route_replies(replies, Arc::clone(&self.connections)));
        let acceptor = tokio::spawn(self.accept_loop(to_dispatch, shutdown));
        vec![acceptor, router]
    }

    async fn accept_loop(
        self,
        to_dispatch: mpsc::UnboundedSender<RoutedFrame>,
        shutdown: Arc<AtomicBool>,
    ) {
        info!(socket = %self.path.display(), "Front intake accepting workers");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("Front intake shutdown requested");
                break;
            }

            // Accept with timeout so we can check shutdown flag
            match tokio::time::timeout(Duration::from_secs(1), self.listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    let connection = ConnectionId::new();
                    debug!(connection = %connection, "Worker connected");
                    tokio::spawn(handle_connection(
                        stream,
                        connection,
                        Arc::clone(&self.connections),
                        to_dispatch.clone(),
                        Arc::clone(&shutdown),
                    ));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Front intake accept error");
                }
                Err(_) => {}
            }
        }

        info!("Front intake loop ended");
    }
}

/// Read calls from one worker and write its replies back.
async fn handle_connection(
    stream: UnixStream,
    connection: ConnectionId,
    connections: Connections,
    to_dispatch: mpsc::UnboundedSender<RoutedFrame>,
    shutdown: Arc<AtomicBool>,
) {
    let (read_half, write_half) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    connections.lock().await.insert(connection, reply_tx);

    // Ends once the connection leaves the table and its queue is drained.
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(body) = reply_rx.recv().await {
            let result = async {
                writer.write_all(body.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                debug!(connection = %connection, error = %e, "Write to worker failed");
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match tokio::time::timeout(Duration::from_secs(1), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                if to_dispatch.send(RoutedFrame::admit(connection, line)).is_err() {
                    warn!(connection = %connection, "Back dispatch is gone");
                    break;
                }
            }
            Ok(Ok(None)) => {
                debug!(connection = %connection, "Worker disconnected (EOF)");
                break;
            }
            Ok(Err(e)) => {
                warn!(connection = %connection, error = %e, "Read error from worker");
                break;
            }
            Err(_) => {}
        }
    }

    connections.lock().await.remove(&connection);
    let _ = writer.await;
}

/// Deliver each reply to the connection named by its outermost hop.
async fn route_replies(mut replies: mpsc::UnboundedReceiver<RoutedFrame>, connections: Connections) {
    while let Some(mut frame) = replies.recv().await {
        let Some(hop) = frame.pop_hop() else {
            warn!("Reply frame has no return address, dropping");
            continue;
        };
        let Some(connection) = ConnectionId::parse(&hop) else {
            warn!(hop = %hop, "Reply frame has an unreadable return address, dropping");
            continue;
        };

        let sender = connections.lock().await.get(&connection).cloned();
        let delivered = sender.is_some_and(|tx| tx.send(frame.body).is_ok());
        if !delivered {
            debug!(connection = %connection, "Worker connection gone, dropping reply");
        }
    }
}

/// Bind a Unix listener readable only by the owner.
pub(crate) fn bind_private(path: &Path) -> Result<UnixListener, BrokerError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(listener)
}
