// ABOUTME: End-to-end tests of the broker relay with real Unix sockets
//
// Workers are simulated by BrokerClient instances connected to the front
// address; the adapter side uses the fixtures in helpers.

mod helpers;

use helpers::{FailingAdapter, MapAdapter, ReversingAdapter, TestBroker};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use skyline::broker::adapter::{ExternalClient, TcpExternalClient};
use skyline::broker::envelope::CorrelationId;
use skyline::client::CallError;

#[tokio::test]
async fn test_loop_back_answers_every_call() {
    let broker = TestBroker::start(None).await;
    let client = broker.client().await;

    let reply = client.call(json!({ "op": "anything" })).await.unwrap();

    assert_eq!(reply, json!({ "op": "anything" }));
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn test_ping_scenario_clears_pending_entry() {
    let adapter = MapAdapter::shared(|mut msg: Value| {
        msg["ok"] = json!(true);
        msg
    });
    let broker = TestBroker::start(Some(adapter)).await;
    let client = broker.client().await;

    let reply = client
        .call_with_id(CorrelationId::from("abc123"), json!({ "op": "ping" }))
        .await
        .unwrap();

    assert_eq!(reply, json!({ "op": "ping", "ok": true }));
    assert!(!client.is_pending(&CorrelationId::from("abc123")).await);
}

#[tokio::test]
async fn test_many_workers_receive_only_their_own_replies() {
    const WORKERS: usize = 4;
    const CALLS: usize = 25;

    let broker = TestBroker::start(None).await;
    let mut clients = Vec::new();
    for _ in 0..WORKERS {
        clients.push(broker.client().await);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for (worker, client) in clients.iter().enumerate() {
        for seq in 0..CALLS {
            let client = client.clone();
            tasks.spawn(async move {
                let payload = json!({ "worker": worker, "seq": seq });
                let reply = client.call(payload.clone()).await.unwrap();
                (payload, reply)
            });
        }
    }

    let mut answered = 0;
    while let Some(joined) = tasks.join_next().await {
        let (payload, reply) = joined.unwrap();
        assert_eq!(reply, payload);
        answered += 1;
    }

    assert_eq!(answered, WORKERS * CALLS);
    for client in &clients {
        assert_eq!(client.pending_count().await, 0);
    }
}

#[tokio::test]
async fn test_reverse_order_replies_resolve_the_right_calls() {
    let broker = TestBroker::start(Some(ReversingAdapter::shared(2))).await;
    let client = broker.client().await;

    let first = client.call_with_id(CorrelationId::from("first"), json!({ "resource": "a" }));
    let second = client.call_with_id(CorrelationId::from("second"), json!({ "resource": "b" }));
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), json!({ "resource": "a" }));
    assert_eq!(second.unwrap(), json!({ "resource": "b" }));
}

#[tokio::test]
async fn test_remote_failure_reaches_caller() {
    let adapter: Arc<dyn ExternalClient> = Arc::new(FailingAdapter {
        error: json!("quota exceeded"),
    });
    let broker = TestBroker::start(Some(adapter)).await;
    let client = broker.client().await;

    let result = client.call(json!({ "op": "write" })).await;

    assert_eq!(result, Err(CallError::Remote(json!("quota exceeded"))));
}

#[tokio::test]
async fn test_callback_style_call_fires_once() {
    let broker = TestBroker::start(None).await;
    let client = broker.client().await;
    let (tx, rx) = tokio::sync::oneshot::channel();

    client
        .call_with(json!({ "n": 1 }), move |result| {
            let _ = tx.send(result);
        })
        .await
        .unwrap();

    assert_eq!(rx.await.unwrap(), Ok(json!({ "n": 1 })));
}

#[tokio::test]
async fn test_tcp_adapter_shares_one_outward_connection() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = service.local_addr().unwrap().to_string();
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let (stream, _) = service.accept().await.unwrap();
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    write_half.write_all(format!("{line}\n").as_bytes()).await.unwrap();
                }
            });
        }
    });

    let adapter: Arc<dyn ExternalClient> = Arc::new(TcpExternalClient::connect(&address).await.unwrap());
    let broker = TestBroker::start(Some(adapter)).await;
    let first = broker.client().await;
    let second = broker.client().await;

    let (a, b) = tokio::join!(first.call(json!("from a")), second.call(json!("from b")));

    assert_eq!(a.unwrap(), json!("from a"));
    assert_eq!(b.unwrap(), json!("from b"));
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stopping_broker_disconnects_workers() {
    let mut broker = TestBroker::start(None).await;
    let client = broker.client().await;
    let _other = broker.client().await;
    assert_eq!(client.call(json!(1)).await, Ok(json!(1)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.broker.connection_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    broker.broker.stop().await.unwrap();
    assert_eq!(broker.broker.connection_count().await, 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_disconnected() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.call(json!(2)).await, Err(CallError::Disconnected));
}

#[tokio::test]
async fn test_tcp_adapter_keeps_equal_ids_from_two_workers_apart() {
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = service.local_addr().unwrap().to_string();

    // Waits for both calls, then answers newest first, echoing each `__cb` it was given.
    tokio::spawn(async move {
        let (stream, _) = service.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut held = Vec::new();
        while held.len() < 2 {
            held.push(lines.next_line().await.unwrap().unwrap());
        }
        let ids: Vec<Value> = held
            .iter()
            .map(|line| serde_json::from_str::<Value>(line).unwrap()["__cb"].clone())
            .collect();
        assert_ne!(ids[0], ids[1]);
        while let Some(line) = held.pop() {
            write_half.write_all(format!("{line}\n").as_bytes()).await.unwrap();
        }
        // Keep the connection open until the test is done.
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let adapter: Arc<dyn ExternalClient> = Arc::new(TcpExternalClient::connect(&address).await.unwrap());
    let broker = TestBroker::start(Some(adapter)).await;
    let worker1 = broker.client().await;
    let worker2 = broker.client().await;

    let (a, b) = tokio::join!(
        worker1.call_with_id(CorrelationId::from("abc123"), json!("worker1")),
        worker2.call_with_id(CorrelationId::from("abc123"), json!("worker2")),
    );

    assert_eq!(a.unwrap(), json!("worker1"));
    assert_eq!(b.unwrap(), json!("worker2"));
    assert_eq!(worker1.pending_count().await, 0);
    assert_eq!(worker2.pending_count().await, 0);
}
