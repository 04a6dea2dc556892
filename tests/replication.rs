//! Multi-node replication scenarios. Each node runs its real HTTP API on a
//! loopback port with its own SQLite file; peers are linked manually.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use peersync::registry::PeerRecord;
use peersync::store::schema::PRODUCTS;
use peersync::store::{Row, Value};
use peersync::sync::Trigger;
use peersync::{Node, NodeConfig};
use serde_json::{json, Value as Json};
use tempfile::TempDir;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct TestNode {
    _dir: TempDir,
    node: Node,
    port: u16,
}

impl TestNode {
    fn id(&self) -> &str {
        &self.node.config().node_id
    }

    fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn product(&self, id: i64) -> Option<Row> {
        self.node.store().get_row(&PRODUCTS, id).await.unwrap()
    }

    async fn write(&self, row: &Row) {
        self.node.store().write_local(&PRODUCTS, row).await.unwrap();
    }
}

async fn spawn_node(node_id: &str, sync_interval: u64) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = NodeConfig {
        node_id: node_id.to_string(),
        host: "127.0.0.1".into(),
        api_port: port,
        sync_interval,
        enable_auto_discovery: false,
        database_path: dir.path().join("node.db"),
        ..NodeConfig::default()
    };
    let node = Node::open(config).await.unwrap();

    let app = node.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestNode {
        _dir: dir,
        node,
        port,
    }
}

/// Registers each node as an active peer of the other.
fn link(a: &TestNode, b: &TestNode) {
    a.node
        .registry()
        .add_or_update(PeerRecord::new(b.id(), "127.0.0.1", b.port))
        .unwrap();
    b.node
        .registry()
        .add_or_update(PeerRecord::new(a.id(), "127.0.0.1", a.port))
        .unwrap();
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn product(id: i64, name: &str, changed: DateTime<Utc>) -> Row {
    Row::new()
        .with("id", Value::Integer(id))
        .with("name", Value::Text(name.to_string()))
        .with("description", Value::Text(format!("{} description", name)))
        .with("category_id", Value::Null)
        .with("manufacturer", Value::Text("Acme".into()))
        .with("price", Value::Real(12.5))
        .with("created_at", Value::Timestamp(changed))
        .with("updated_at", Value::Timestamp(changed))
        .with("is_active", Value::Bool(true))
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_round_converges_both_directions() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    a.write(&product(1, "kettle", at(100))).await;
    b.write(&product(2, "toaster", at(150))).await;

    let status = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(status.errors.is_empty(), "{:?}", status.errors);

    assert_eq!(b.product(1).await, a.product(1).await);
    assert_eq!(a.product(2).await, b.product(2).await);
    assert!(b.product(1).await.is_some());
    assert!(a.product(2).await.is_some());

    let cursor = a.node.engine().cursor("zzz", "products");
    assert!(cursor.pulled.is_some());
    assert!(cursor.pushed.is_some());
}

#[tokio::test]
async fn test_tie_larger_identity_wins_on_both_nodes() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    a.write(&product(5, "from-a", at(200))).await;
    let theirs = product(5, "from-b", at(200));
    b.write(&theirs).await;

    let status = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(status.errors.is_empty(), "{:?}", status.errors);
    assert!(status.conflicts_resolved >= 1);

    assert_eq!(a.product(5).await, Some(theirs.clone()));
    assert_eq!(b.product(5).await, Some(theirs));
}

#[tokio::test]
async fn test_newer_row_wins_regardless_of_identity() {
    // The newer version lives on the node with the smaller identity.
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    let newer = product(3, "fresh", at(300));
    a.write(&newer).await;
    b.write(&product(3, "stale", at(200))).await;

    b.node.engine().sync_with_peers(Trigger::Manual).await;

    assert_eq!(a.product(3).await, Some(newer.clone()));
    assert_eq!(b.product(3).await, Some(newer));
}

#[tokio::test]
async fn test_second_round_is_incremental_and_idempotent() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    a.write(&product(1, "kettle", at(100))).await;
    let first = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert_eq!(first.rows_sent, 1);
    let snapshot = b.product(1).await;

    let second = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(second.errors.is_empty());
    assert_eq!(second.rows_sent, 0);
    assert_eq!(second.rows_applied, 0);
    assert_eq!(b.product(1).await, snapshot);

    // Stamped long before the first round, written after it.
    let later = product(10, "lamp", at(50));
    a.write(&later).await;
    let third = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert_eq!(third.rows_sent, 1);
    assert_eq!(b.product(10).await, Some(later));
}

#[tokio::test]
async fn test_backdated_writes_after_a_round_still_replicate() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    b.write(&product(1, "kettle", at(100))).await;
    let first = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(first.errors.is_empty(), "{:?}", first.errors);
    assert!(a.product(1).await.is_some());

    // Writers whose clocks lag behind the round that just finished.
    let from_b = product(2, "toaster", Utc::now() - Duration::seconds(30));
    b.write(&from_b).await;
    let from_a = product(3, "lamp", Utc::now() - Duration::milliseconds(50));
    a.write(&from_a).await;

    let second = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(second.errors.is_empty(), "{:?}", second.errors);
    assert_eq!(a.product(2).await, b.product(2).await);
    assert!(a.product(2).await.is_some());
    assert_eq!(b.product(3).await, a.product(3).await);
    assert!(b.product(3).await.is_some());
}

#[tokio::test]
async fn test_concurrent_rounds_and_writes_converge() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    for i in 0..10 {
        a.write(&product(100 + i, "from-a", at(1_000 + i))).await;
        b.write(&product(200 + i, "from-b", at(2_000 + i))).await;
    }

    let writes = async {
        for i in 0..10 {
            a.write(&product(300 + i, "during", at(3_000 + i))).await;
            b.write(&product(400 + i, "during", at(4_000 + i))).await;
            tokio::task::yield_now().await;
        }
    };
    let (on_a, on_b, ()) = tokio::join!(
        a.node.engine().sync_with_peers(Trigger::Manual),
        b.node.engine().sync_with_peers(Trigger::Manual),
        writes
    );
    assert!(on_a.errors.is_empty(), "{:?}", on_a.errors);
    assert!(on_b.errors.is_empty(), "{:?}", on_b.errors);

    let settle = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(settle.errors.is_empty(), "{:?}", settle.errors);

    for id in (100..110).chain(200..210).chain(300..310).chain(400..410) {
        let on_a = a.product(id).await;
        assert!(on_a.is_some(), "row {} missing on aaa", id);
        assert_eq!(on_a, b.product(id).await, "row {} diverged", id);
    }
}

#[tokio::test]
async fn test_replayed_apply_leaves_state_unchanged() {
    let b = spawn_node("zzz", 3600).await;
    let http = reqwest::Client::new();
    let body = json!({
        "table": "products",
        "data": [product(4, "chair", at(400)).to_json()],
        "count": 1,
        "source_node": "aaa",
        "sync_timestamp": "2024-01-01T00:00:00Z"
    });

    for _ in 0..2 {
        let response = http
            .post(format!("{}/p2p/apply-changes/products", b.url()))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    assert_eq!(b.product(4).await, Some(product(4, "chair", at(400))));
    let feed: Json = http
        .get(format!("{}/p2p/table-changes/products", b.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(feed["count"], 1);
}

#[tokio::test]
async fn test_unreachable_peer_is_skipped_then_evicted() {
    let a = spawn_node("aaa", 3600).await;
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    a.node
        .registry()
        .add_or_update(PeerRecord::new("ghost", "127.0.0.1", dead))
        .unwrap();

    let report = a.node.discovery().check_health().await;
    assert_eq!(report.inactive, vec!["ghost"]);
    assert!(a.node.registry().active_peers().is_empty());

    let report = a
        .node
        .discovery()
        .check_health_at(Utc::now() + Duration::minutes(3))
        .await;
    assert_eq!(report.evicted, vec!["ghost"]);
    assert!(a.node.registry().get("ghost").is_none());

    let round = a.node.engine().sync_with_peers(Trigger::Manual).await;
    assert!(round.peers_contacted.is_empty());
}

#[tokio::test]
async fn test_notification_triggers_pull() {
    let a = spawn_node("aaa", 3600).await;
    let b = spawn_node("zzz", 3600).await;
    link(&a, &b);

    a.write(&product(7, "desk", at(700))).await;

    let response: Json = reqwest::Client::new()
        .post(format!("{}/p2p/notify-changes", b.url()))
        .json(&json!({
            "source_peer": "aaa",
            "tables": ["products"],
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["sync_triggered"], true);

    assert!(eventually(|| async { b.product(7).await.is_some() }).await);
}

#[tokio::test]
async fn test_local_change_propagates_in_low_latency_mode() {
    let a = spawn_node("aaa", 5).await;
    let b = spawn_node("zzz", 5).await;
    link(&a, &b);

    a.node
        .record_local_change("products", &product(9, "shelf", at(900)))
        .await
        .unwrap();

    assert!(eventually(|| async { b.product(9).await.is_some() }).await);
}

#[tokio::test]
async fn test_websocket_pushes_status_and_events() {
    let a = spawn_node("aaa", 3600).await;
    let ws_url = format!("ws://127.0.0.1:{}/p2p/ws", a.port);
    let (mut socket, _) = connect_async(ws_url.as_str()).await.unwrap();

    let first = next_json(&mut socket).await;
    assert_eq!(first["type"], "status");
    assert_eq!(first["data"]["node_id"], "aaa");

    socket
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let pong = next_json(&mut socket).await;
    assert_eq!(pong["type"], "pong");

    reqwest::Client::new()
        .post(format!("{}/p2p/peers", a.url()))
        .json(&json!({"peer_id": "zzz", "host": "127.0.0.1", "port": 9}))
        .send()
        .await
        .unwrap();

    let event = next_json(&mut socket).await;
    assert_eq!(event["type"], "sync_event");
    assert_eq!(event["data"]["type"], "peer_admitted");
    assert_eq!(event["data"]["peer_id"], "zzz");
}

async fn next_json<S>(socket: &mut S) -> Json
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}
