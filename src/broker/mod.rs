// ABOUTME: Broker relay run by the master process
// ABOUTME: Front intake, back dispatch and reply sink funnel worker calls onto one outward connection

//! Broker relay.
//!
//! ```text
//!  worker ─┐                                          ┌─ ExternalClient ─► service
//!  worker ─┼─► front intake ─► back dispatch ─► reply sink
//!  worker ─┘   (front.sock)     (back.sock)           └─ loop-back (no adapter)
//! ```
//!
//! Workers connect to the front address. The front intake tags each line with
//! the connection it came from, back dispatch carries the frame to the reply
//! sink, and the reply travels the same way back. The relay never parses the
//! envelope inside a frame.

pub mod adapter;
pub mod dispatch;
pub mod envelope;
pub mod frame;
pub mod front;
pub mod sink;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use adapter::{AdapterError, ExternalClient};
use dispatch::BackDispatch;
use front::{Connections, FrontIntake};
use sink::ReplySink;

/// Errors from the broker relay
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external client adapter failed
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// `start` was called twice
    #[error("Broker already running")]
    AlreadyRunning,

    /// `stop` was called before `start`
    #[error("Broker not running")]
    NotRunning,
}

/// The master's relay: owns both socket files and every relay task.
pub struct Broker {
    config: BrokerConfig,
    adapter: Option<Arc<dyn ExternalClient>>,
    shutdown: Arc<AtomicBool>,
    front_path: Option<PathBuf>,
    back_path: Option<PathBuf>,
    connections: Option<Connections>,
    tasks: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Relay that hands calls to `adapter`, or loops them back when `None`.
    #[must_use]
    pub fn new(config: BrokerConfig, adapter: Option<Arc<dyn ExternalClient>>) -> Self {
        Self {
            config,
            adapter,
            shutdown: Arc::new(AtomicBool::new(false)),
            front_path: None,
            back_path: None,
            connections: None,
            tasks: Vec::new(),
        }
    }

    /// Bind both addresses and connect the reply sink.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if self.is_running() {
            return Err(BrokerError::AlreadyRunning);
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let front_path = self.config.front_path()?;
        let back_path = self.config.back_path()?;

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let front = FrontIntake::bind(&front_path)?;
        let dispatch = BackDispatch::bind(&back_path)?;
        self.connections = Some(front.connections());

        self.tasks
            .extend(front.spawn(calls_tx, replies_rx, Arc::clone(&self.shutdown)));
        self.tasks
            .extend(dispatch.spawn(calls_rx, replies_tx, Arc::clone(&self.shutdown)));

        let sink = ReplySink::new(self.adapter.clone());
        let loop_back = sink.is_loop_back();
        self.tasks.extend(sink.connect(&back_path).await?);

        info!(
            front = %front_path.display(),
            back = %back_path.display(),
            loop_back,
            "Broker started"
        );

        self.front_path = Some(front_path);
        self.back_path = Some(back_path);
        Ok(())
    }

    /// Stop every relay task and remove the socket files.
    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        info!(connections = self.connection_count().await, "Stopping broker");
        self.shutdown.store(true, Ordering::SeqCst);

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        self.remove_socket_files();
        self.connections = None;
        debug!("Broker stopped");
        Ok(())
    }

    /// True between `start` and `stop`
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Front address workers connect to (once started)
    #[must_use]
    pub fn front_path(&self) -> Option<&Path> {
        self.front_path.as_deref()
    }

    /// Back address (once started)
    #[must_use]
    pub fn back_path(&self) -> Option<&Path> {
        self.back_path.as_deref()
    }

    /// Number of worker connections on the front intake (0 when stopped)
    pub async fn connection_count(&self) -> usize {
        match &self.connections {
            Some(connections) => connections.lock().await.len(),
            None => 0,
        }
    }

    fn remove_socket_files(&mut self) {
        for path in [self.front_path.take(), self.back_path.take()].into_iter().flatten() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        self.remove_socket_files();
    }
}
