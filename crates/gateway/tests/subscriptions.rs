#![forbid(unsafe_code)]

mod support;

use quarry_gateway::{LocalSubscriptionStore, SubscriptionServer, SubscriptionStore};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use support::{RecordingSink, build_gateway, token};

fn server(test_name: &str, production: bool) -> (SubscriptionServer, Arc<RecordingSink>) {
    let gateway = build_gateway(test_name, production);
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(LocalSubscriptionStore::new(Duration::from_secs(60)));
    (SubscriptionServer::new(gateway, store, sink.clone()), sink)
}

async fn handshake(server: &SubscriptionServer, sink: &RecordingSink, connection_id: &str) {
    server
        .process_message(connection_id, json!({"authorization": token()}), false)
        .await;
    assert_eq!(sink.take(), vec![(connection_id.to_string(), json!({"handshake": true}))]);
}

fn messages(sent: Vec<(String, Value)>) -> Vec<Value> {
    sent.into_iter().map(|(_, message)| message).collect()
}

fn count_query() -> Value {
    json!({"measures": ["orders.count"], "dimensions": ["orders.status"]})
}

#[tokio::test]
async fn rpc_without_handshake_is_not_authorized() {
    let (server, sink) = server("ws_not_authorized", true);
    server
        .process_message("c1", json!({"messageId": 7, "method": "meta"}), false)
        .await;
    assert_eq!(
        messages(sink.take()),
        vec![json!({"messageId": 7, "message": {"error": "Not authorized"}, "status": 403})]
    );
}

#[tokio::test]
async fn failed_handshake_reports_forbidden() {
    let (server, sink) = server("ws_bad_handshake", true);
    server
        .process_message("c1", json!({"authorization": "forged"}), false)
        .await;
    let sent = messages(sink.take());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["status"], 403);
    assert_eq!(sent[0]["message"], json!({"error": "Invalid token"}));
}

#[tokio::test]
async fn meta_is_answered_and_acknowledged() {
    let (server, sink) = server("ws_meta", true);
    handshake(&server, &sink, "c1").await;
    server
        .process_raw("c1", r#"{"messageId": "m1", "method": "meta", "params": {}}"#)
        .await;
    let sent = messages(sink.take());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["messageId"], "m1");
    assert_eq!(sent[0]["status"], 200);
    assert_eq!(sent[0]["message"]["cubes"][0]["name"], "orders");
    assert_eq!(sent[1], json!({"messageProcessedId": "m1"}));
}

#[tokio::test]
async fn malformed_messages_are_rejected_without_ack() {
    let (server, sink) = server("ws_malformed", true);
    handshake(&server, &sink, "c1").await;

    server
        .process_message("c1", json!({"messageId": "m1", "method": "drop"}), false)
        .await;
    server
        .process_message("c1", json!({"method": "meta"}), false)
        .await;

    let sent = messages(sink.take());
    assert_eq!(
        sent,
        vec![
            json!({
                "messageId": "m1",
                "message": {"type": "UserError", "error": "Unsupported method: drop"},
                "status": 400
            }),
            json!({
                "messageId": null,
                "message": {"type": "UserError", "error": "messageId is required"},
                "status": 400
            }),
        ]
    );
}

#[tokio::test]
async fn method_errors_are_replied_and_still_acknowledged() {
    let (server, sink) = server("ws_load_error", true);
    handshake(&server, &sink, "c1").await;
    server
        .process_message(
            "c1",
            json!({"messageId": 3, "method": "load", "params": {"query": {}}}),
            false,
        )
        .await;
    let sent = messages(sink.take());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["status"], 400);
    assert_eq!(sent[0]["message"]["type"], "UserError");
    assert_eq!(sent[1], json!({"messageProcessedId": 3}));
}

#[tokio::test]
async fn subscription_redelivers_only_changed_results() {
    let (server, sink) = server("ws_subscribe", true);
    handshake(&server, &sink, "c1").await;
    server
        .process_message(
            "c1",
            json!({
                "messageId": "s1",
                "method": "subscribe",
                "params": {"query": count_query(), "ignored": true}
            }),
            false,
        )
        .await;
    let first = messages(sink.take());
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["messageId"], "s1");
    assert_eq!(
        first[0]["message"]["data"],
        json!([
            {"orders.status": "shipped", "orders.count": 2},
            {"orders.status": "processing", "orders.count": 1}
        ])
    );

    server.process_subscriptions().await;
    assert_eq!(
        messages(sink.take()),
        vec![json!({"messageProcessedId": "s1"})],
        "an unchanged result is not delivered again"
    );

    server
        .process_message("c1", json!({"unsubscribe": "s1"}), false)
        .await;
    server.process_subscriptions().await;
    assert!(sink.take().is_empty());
}

#[tokio::test]
async fn one_failing_subscription_does_not_block_the_tick() {
    let (server, sink) = server("ws_isolated", true);
    handshake(&server, &sink, "bad").await;
    handshake(&server, &sink, "good").await;
    server
        .process_message(
            "bad",
            json!({"messageId": "b", "method": "subscribe", "params": {"query": {"measures": ["orders.nope"]}}}),
            false,
        )
        .await;
    server
        .process_message(
            "good",
            json!({"messageId": "g", "method": "subscribe", "params": {"query": count_query()}}),
            false,
        )
        .await;
    sink.take();

    server.process_subscriptions().await;
    let sent = sink.take();
    let for_bad = sent
        .iter()
        .filter(|(connection, _)| connection == "bad")
        .map(|(_, message)| message.clone())
        .collect::<Vec<_>>();
    let for_good = sent
        .iter()
        .filter(|(connection, _)| connection == "good")
        .map(|(_, message)| message.clone())
        .collect::<Vec<_>>();
    assert_eq!(for_bad.len(), 2, "error reply and ack: {for_bad:?}");
    assert_eq!(for_bad[0]["status"], 400);
    assert_eq!(for_good, vec![json!({"messageProcessedId": "g"})]);
}

#[tokio::test]
async fn disconnect_purges_the_connection() {
    let (server, sink) = server("ws_disconnect", true);
    handshake(&server, &sink, "c1").await;
    server
        .process_message(
            "c1",
            json!({"messageId": "s1", "method": "subscribe", "params": {"query": count_query()}}),
            false,
        )
        .await;
    sink.take();

    server.disconnect("c1").await;
    server.process_subscriptions().await;
    assert!(sink.take().is_empty());

    server
        .process_message("c1", json!({"messageId": "m2", "method": "meta"}), false)
        .await;
    assert_eq!(messages(sink.take())[0]["status"], 403);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frames_sent_back_to_back_are_handled_in_order() {
    let (server, sink) = server("ws_ordered_frames", true);
    let inbox = server.open_connection("c1");
    inbox.push(json!({"authorization": token()}).to_string());
    inbox.push(r#"{"messageId": "m1", "method": "meta"}"#.to_string());
    inbox.close().await;

    let sent = messages(sink.take());
    assert_eq!(sent.len(), 3, "{sent:?}");
    assert_eq!(sent[0], json!({"handshake": true}));
    assert_eq!(sent[1]["messageId"], "m1");
    assert_eq!(sent[1]["status"], 200);
    assert_eq!(sent[2], json!({"messageProcessedId": "m1"}));
}

#[tokio::test]
async fn invalid_envelopes_get_an_error_frame_and_no_ack() {
    let (server, sink) = server("ws_envelopes", true);
    handshake(&server, &sink, "c1").await;

    server
        .process_message(
            "c1",
            json!({"messageId": "m1", "method": "meta", "fieldIsNotAllowed": true}),
            false,
        )
        .await;
    server
        .process_message(
            "c1",
            json!({
                "messageId": "12345678901234567",
                "requestId": "a".repeat(65),
                "method": "meta"
            }),
            false,
        )
        .await;
    server
        .process_message(
            "c1",
            json!({"messageId": 2, "requestId": "a".repeat(65), "method": "meta"}),
            false,
        )
        .await;

    let sent = messages(sink.take());
    assert_eq!(
        sent,
        vec![
            json!({
                "messageId": "m1",
                "message": {"type": "UserError", "error": "Unknown message field: fieldIsNotAllowed"},
                "status": 400
            }),
            json!({
                "messageId": null,
                "message": {
                    "type": "UserError",
                    "error": "messageId must be a number or a string of at most 16 characters"
                },
                "status": 400
            }),
            json!({
                "messageId": 2,
                "message": {
                    "type": "UserError",
                    "error": "requestId must be a string of at most 64 characters"
                },
                "status": 400
            }),
        ]
    );
}

#[tokio::test]
async fn ids_at_the_length_limit_are_accepted() {
    let (server, sink) = server("ws_id_limits", true);
    handshake(&server, &sink, "c1").await;
    server
        .process_message(
            "c1",
            json!({
                "messageId": "1234567890123456",
                "requestId": "r".repeat(64),
                "method": "meta"
            }),
            false,
        )
        .await;
    let sent = messages(sink.take());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["status"], 200);
    assert_eq!(sent[1], json!({"messageProcessedId": "1234567890123456"}));
}

#[tokio::test]
async fn subscribing_after_disconnect_leaves_nothing_to_poll() {
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(LocalSubscriptionStore::new(Duration::from_secs(60)));
    let server = SubscriptionServer::new(
        build_gateway("ws_late_subscribe", true),
        store.clone(),
        sink.clone(),
    );
    handshake(&server, &sink, "c1").await;
    server.disconnect("c1").await;

    store
        .subscribe("c1", "s1", json!({"messageId": "s1", "method": "subscribe"}), json!({}))
        .await
        .expect("subscribe");
    assert!(store.get_all_subscriptions().await.expect("all").is_empty());
    server.process_subscriptions().await;
    assert!(sink.take().is_empty());
}
