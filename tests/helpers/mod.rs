// ABOUTME: Shared fixtures for integration tests
//
// Provides:
// - TestBroker: a broker bound in a temporary socket directory
// - MapAdapter: external client that answers each call with a function of its payload
// - ReversingAdapter: holds calls until a batch is complete, then answers them in reverse

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

use skyline::broker::Broker;
use skyline::broker::adapter::{ExternalClient, ReplyHandle};
use skyline::broker::envelope::Envelope;
use skyline::client::BrokerClient;
use skyline::config::BrokerConfig;

/// A running broker plus the directory holding its sockets.
pub struct TestBroker {
    pub dir: TempDir,
    pub config: BrokerConfig,
    pub broker: Broker,
}

impl TestBroker {
    pub async fn start(adapter: Option<Arc<dyn ExternalClient>>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = BrokerConfig::with_socket_dir(dir.path());
        config.call_timeout = Duration::from_secs(5);

        let mut broker = Broker::new(config.clone(), adapter);
        broker.start().await.unwrap();
        Self { dir, config, broker }
    }

    /// A fresh correlation client, as a worker would hold.
    pub async fn client(&self) -> BrokerClient {
        let front = self.broker.front_path().unwrap();
        BrokerClient::connect(front, &self.config).await.unwrap()
    }
}

/// Replies to every call with `f(msg)`.
pub struct MapAdapter<F> {
    f: F,
}

impl<F> MapAdapter<F>
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    pub fn shared(f: F) -> Arc<dyn ExternalClient> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> ExternalClient for MapAdapter<F>
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    async fn on_call(&self, payload: String, reply: ReplyHandle) {
        let call = Envelope::from_line(&payload).unwrap();
        let msg = call.body.into_result().unwrap();
        let line = Envelope::reply(call.id, (self.f)(msg)).to_line().unwrap();
        reply.emit_reply(line).unwrap();
    }
}

/// Answers every call with a failure envelope carrying `error`.
pub struct FailingAdapter {
    pub error: Value,
}

#[async_trait]
impl ExternalClient for FailingAdapter {
    async fn on_call(&self, payload: String, reply: ReplyHandle) {
        let call = Envelope::from_line(&payload).unwrap();
        reply.emit_failure(call.id, self.error.clone()).unwrap();
    }
}

/// Echoes calls, but only once `batch` of them arrived, newest first.
pub struct ReversingAdapter {
    batch: usize,
    held: Mutex<Vec<(String, ReplyHandle)>>,
}

impl ReversingAdapter {
    pub fn shared(batch: usize) -> Arc<dyn ExternalClient> {
        Arc::new(Self {
            batch,
            held: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ExternalClient for ReversingAdapter {
    async fn on_call(&self, payload: String, reply: ReplyHandle) {
        let mut held = self.held.lock().await;
        held.push((payload, reply));
        if held.len() < self.batch {
            return;
        }
        while let Some((payload, reply)) = held.pop() {
            reply.emit_reply(payload).unwrap();
        }
    }
}
