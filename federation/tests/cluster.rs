//! End-to-end cluster tests: real listeners on ephemeral ports, real
//! WebSocket peer connections, JSON-RPC over HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use federation::{FederationConfig, Node};
use runtime::RuntimeConfig;
use runtime::ast::{BinaryOp, Expr, Program, ReceiverDecl};

/// server counter { state c = 0; increment(by) { state.set("c",
/// state.get("c") + (by ?? 1)) } get_count() { state.get("c") } }
fn counter_program() -> Program {
    Program {
        body: vec![Expr::ServerDecl {
            name: "counter".to_string(),
            state: vec![("c".to_string(), Expr::number(0.0))],
            receivers: vec![
                ReceiverDecl {
                    name: "increment".to_string(),
                    params: vec!["by".to_string()],
                    body: Expr::method(
                        Expr::ident("state"),
                        "set",
                        vec![
                            Expr::string("c"),
                            Expr::binary(
                                BinaryOp::Add,
                                Expr::method(Expr::ident("state"), "get", vec![Expr::string("c")]),
                                Expr::binary(
                                    BinaryOp::Coalesce,
                                    Expr::ident("by"),
                                    Expr::number(1.0),
                                ),
                            ),
                        ],
                    ),
                },
                ReceiverDecl {
                    name: "get_count".to_string(),
                    params: vec![],
                    body: Expr::method(Expr::ident("state"), "get", vec![Expr::string("c")]),
                },
            ],
        }],
    }
}

fn node_config(node_id: &str) -> FederationConfig {
    FederationConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        node_id: Some(node_id.to_string()),
        ..FederationConfig::default()
    }
}

async fn start_node(config: FederationConfig, with_counter: bool) -> Node {
    let node = Node::start(config, RuntimeConfig::default())
        .await
        .expect("node must start");
    if with_counter {
        node.runtime()
            .evaluate(&counter_program())
            .await
            .expect("counter program must evaluate");
    }
    node
}

async fn connect(from: &Node, to: &Node) {
    from.overlay()
        .connect_to_peer(&format!("ws://{}", to.addr()), to.node_id())
        .await
        .expect("peer connect must succeed");
    // Give the accepting side a moment to register the inbound link.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn rpc(addr: SocketAddr, body: serde_json::Value) -> serde_json::Value {
    reqwest::Client::new()
        .post(format!("http://{addr}/rpc"))
        .json(&body)
        .send()
        .await
        .expect("rpc request must be sent")
        .json()
        .await
        .expect("rpc response must be json")
}

#[tokio::test]
async fn local_rpc_calls_increment_sequentially() {
    let node = start_node(node_config("1111111111111111"), true).await;
    let addr = node.addr();

    // Three concurrent increments against one mailbox.
    let calls = (0..3).map(|i| {
        rpc(
            addr,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "counter.increment",
                "params": [],
                "id": i,
            }),
        )
    });
    for response in futures::future::join_all(calls).await {
        assert!(response.get("error").is_none(), "unexpected: {response}");
    }

    let count = rpc(
        addr,
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "counter.get_count",
            "params": [],
            "id": 99,
        }),
    )
    .await;
    assert_eq!(count["result"], serde_json::json!(3.0));
    node.shutdown();
}

#[tokio::test]
async fn named_parameters_map_through_declared_order() {
    let node = start_node(node_config("2222222222222222"), true).await;

    let response = rpc(
        node.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "counter.increment",
            "params": {"by": 7.0},
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["result"], serde_json::json!(7.0));
    node.shutdown();
}

#[tokio::test]
async fn unknown_server_is_method_not_found() {
    let node = start_node(node_config("3333333333333333"), false).await;

    let response = rpc(
        node.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "nope.x",
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], serde_json::json!(-32601));
    node.shutdown();
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let node = start_node(node_config("4444444444444444"), false).await;

    let response: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{}/rpc", node.addr()))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], serde_json::json!(-32700));
    node.shutdown();
}

#[tokio::test]
async fn remote_call_reaches_a_directly_connected_peer() {
    let a = start_node(node_config("aaaa000000000000"), false).await;
    let b = start_node(node_config("bbbb000000000000"), true).await;
    connect(&a, &b).await;

    let response = rpc(
        a.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "remote_call",
            "params": {
                "node_id": b.node_id(),
                "server_name": "counter",
                "method": "increment",
                "args": [5.0],
            },
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["result"], serde_json::json!(5.0), "got {response}");

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn registry_sync_lets_bare_names_route_to_peers() {
    let a = start_node(node_config("aaaa111111111111"), false).await;
    let b = start_node(node_config("bbbb111111111111"), true).await;
    connect(&a, &b).await;
    // The post-connect registry sync advertises counter to a.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = rpc(
        a.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "counter.increment",
            "params": [2.0],
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["result"], serde_json::json!(2.0), "got {response}");

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn multi_hop_call_crosses_a_relay_node() {
    // Chain a - b - c with no a-c connection.
    let a = start_node(node_config("aaaa222222222222"), false).await;
    let b = start_node(node_config("bbbb222222222222"), false).await;
    let c = start_node(node_config("cccc222222222222"), true).await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    let response = rpc(
        a.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "remote_call",
            "params": {
                "node_id": c.node_id(),
                "server_name": "counter",
                "method": "increment",
                "args": [7.0],
            },
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["result"], serde_json::json!(7.0), "got {response}");

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn exhausted_ttl_surfaces_as_internal_error_with_tag() {
    let mut config_a = node_config("aaaa333333333333");
    config_a.ttl_default = 1;
    let a = start_node(config_a, false).await;
    let b = start_node(node_config("bbbb333333333333"), false).await;
    let c = start_node(node_config("cccc333333333333"), true).await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    let response = rpc(
        a.addr(),
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "remote_call",
            "params": {
                "node_id": c.node_id(),
                "server_name": "counter",
                "method": "increment",
                "args": [1.0],
            },
            "id": 1,
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], serde_json::json!(-32603));
    assert_eq!(response["error"]["data"], serde_json::json!("TTLExceeded"));

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn registry_endpoints_report_peers_and_servers() {
    let a = start_node(node_config("aaaa444444444444"), false).await;
    let b = start_node(node_config("bbbb444444444444"), true).await;
    connect(&a, &b).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let registry: serde_json::Value = client
        .get(format!("http://{}/registry", a.addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(registry["node_id"], serde_json::json!(a.node_id()));
    let peers = registry["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["node_id"], serde_json::json!(b.node_id()));
    assert_eq!(peers[0]["is_healthy"], serde_json::json!(true));

    // b's counter shows up in a's catalogue as a non-local server.
    let servers = registry["local_servers"].as_array().unwrap();
    assert!(
        servers
            .iter()
            .any(|s| s["name"] == "counter" && s["is_local"] == serde_json::json!(false)),
        "got {registry}"
    );

    let health: serde_json::Value = client
        .get(format!("http://{}/health", b.addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], serde_json::json!("ok"));
    assert_eq!(health["servers"], serde_json::json!(1));

    a.shutdown();
    b.shutdown();
}
