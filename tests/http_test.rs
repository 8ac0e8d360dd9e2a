//! HTTP API integration tests over a real listener.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bebo::config::Config;
use bebo::node::Node;
use bebo::seeds::Seeds;

async fn start_node() -> (Arc<Node>, String) {
    let host: IpAddr = "127.0.0.1".parse().unwrap();
    let config = Config {
        host,
        port: 0,
        http_port: 0,
        debug: false,
        hex_mode: false,
        no_mpr: false,
        v6_ok: true,
        me: HashSet::from([host]),
    };
    let (node, _events_rx) = Node::new(config, Seeds::empty());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(bebo::http::serve(
        node.clone(),
        listener,
        CancellationToken::new(),
    ));
    (node, format!("http://{addr}"))
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/message"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 1);
    assert_eq!(body["least"], 1);
    assert_eq!(body["greatest"], 1);
    assert!(body["uuid"].is_string());

    // duplicate content: same id, not created
    let resp = client
        .post(format!("{base}/message"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["id"], 1);

    let resp = client
        .get(format!("{base}/message?first=0&count=10"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["id"], 1);
    assert_eq!(messages[0]["message"], "aGVsbG8=");

    let resp = client
        .get(format!("{base}/messages/nextsequence"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "2");
}

#[tokio::test]
async fn whiteboard_write_and_read_one() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/messages/write/"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["messageId"], 1);

    let resp = client
        .post(format!("{base}/messages/writeWithTimeout/1.5/"))
        .body("timed payload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["messageId"], 2);
    assert_eq!(body["timeoutSecs"], 90);

    let resp = client
        .get(format!("{base}/messages/readone/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), b"payload");

    let resp = client
        .get(format!("{base}/messages/readone/99"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn listener_cursors_see_each_message_once() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/messages/write/"))
        .body("one")
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{base}/messages/read/tester"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let rows: serde_json::Value = resp.json().await.unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], "application/octet-stream");
    assert_eq!(rows[0][1], "b25l");
    assert_eq!(rows[0][2], "");

    // nothing new for the same listener
    let resp = client
        .get(format!("{base}/messages/read/tester"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // a different listener still sees everything
    let resp = client
        .get(format!("{base}/messages/read/other"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn flush_changes_uuid() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    let before: serde_json::Value = client
        .get(format!("{base}/uuid"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // the redirect back to the index page is followed
    let resp = client.get(format!("{base}/flush")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let after: serde_json::Value = client
        .get(format!("{base}/uuid"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_ne!(before["uuid"], after["uuid"]);
}

#[tokio::test]
async fn status_routes() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/connected")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "0");

    // vacuously true with no neighbors
    let resp = client
        .get(format!("{base}/allneighborsnonempty"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "1");

    let resp = client
        .get(format!("{base}/neighbor/10.53.0.99"))
        .send()
        .await
        .unwrap();
    // GET on a DELETE route
    assert_eq!(resp.status(), 405);

    let resp = client
        .delete(format!("{base}/neighbor/10.53.0.99"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn explain_renders_hexdump() {
    let (_node, base) = start_node().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/messages/write/"))
        .body("hello")
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{base}/messages/explain/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("68 65 6c 6c 6f"));
    assert!(text.contains("hello"));

    let resp = client
        .get(format!("{base}/messages/explain/42"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
