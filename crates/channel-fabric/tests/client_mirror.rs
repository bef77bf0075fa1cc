use channel_fabric::client::{prehash, MirrorEvent, SubscriptionManager, CREDENTIALS_KEY};
use channel_fabric::mock::MockLink;
use channel_fabric::{DataStore, FabricError, MemoryStore, Responder};
use serde_json::{json, Value};
use std::sync::Arc;

fn manager() -> (Arc<MockLink>, SubscriptionManager<MockLink>) {
    let link = Arc::new(MockLink::new());
    let manager = SubscriptionManager::new(link.clone());
    (link, manager)
}

fn subscribes(link: &MockLink) -> Vec<Value> {
    link.requests()
        .into_iter()
        .filter(|(msg, _)| msg == "subscribe")
        .map(|(_, data)| data)
        .collect()
}

#[tokio::test]
async fn each_reconnect_replays_one_subscribe_per_channel_in_order() {
    let (link, manager) = manager();

    // Disconnected: counted, not sent.
    manager.subscribe("room.b").await.unwrap();
    manager.subscribe("room.a").await.unwrap();
    manager.subscribe("room.b").await.unwrap();
    assert!(link.requests().is_empty());

    for _ in 0..2 {
        link.expect_request("subscribe").return_ok(Value::Null);
        link.expect_request("subscribe").return_ok(Value::Null);
    }
    manager.handle_connect("u1").await;
    manager.handle_disconnect();
    manager.handle_connect("u2").await;

    link.verify();
    assert_eq!(
        subscribes(&link),
        vec![json!("room.b"), json!("room.a"), json!("room.b"), json!("room.a")]
    );
    assert_eq!(manager.get_channel("room.b").unwrap().subscriptions, 2);
    assert_eq!(manager.client_id().as_deref(), Some("u2"));
}

#[tokio::test]
async fn last_unsubscribe_is_sent_and_forgets_the_channel() {
    let (link, manager) = manager();
    link.expect_request("subscribe").return_ok(Value::Null);
    link.expect_request("unsubscribe").return_ok(Value::Null);
    manager.handle_connect("u1").await;

    manager.subscribe("room.a").await.unwrap();
    manager.subscribe("room.a").await.unwrap();
    manager.unsubscribe("room.a").await.unwrap();
    assert!(manager.get_channel("room.a").is_some());
    manager.unsubscribe("room.a").await.unwrap();

    link.verify();
    assert!(manager.get_channel("room.a").is_none());

    // Nothing left to replay.
    manager.handle_disconnect();
    manager.handle_connect("u2").await;
    assert_eq!(link.requests().len(), 2);
}

#[tokio::test]
async fn mirror_follows_snapshot_and_diffs() {
    let (link, manager) = manager();
    link.expect_request("subscribe").return_ok(Value::Null);
    manager.handle_connect("u1").await;
    manager.subscribe("room.a").await.unwrap();
    let mut events = manager.events();

    manager.handle_channel_msg(
        "room.a",
        "channel_data",
        json!({ "public": { "topic": "intro", "scores": { "bob": 1 } } }),
        Responder::detached(),
    );
    assert!(manager.get_channel("room.a").unwrap().got_subscription);
    assert_eq!(manager.get_channel_data("room.a", "public.topic"), Some(json!("intro")));

    manager.handle_channel_msg(
        "room.a",
        "apply_channel_data",
        json!({ "key": "public.scores.alice", "value": 7 }),
        Responder::detached(),
    );
    manager.handle_channel_msg(
        "room.a",
        "apply_channel_data",
        json!({ "key": "public.topic" }),
        Responder::detached(),
    );

    let channel = manager.get_channel("room.a").unwrap();
    assert_eq!(channel.public(), &json!({ "scores": { "bob": 1, "alice": 7 } }));

    assert_eq!(
        events.try_recv().unwrap(),
        MirrorEvent::ChannelData { channel_id: "room.a".to_string() }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        MirrorEvent::ApplyChannelData {
            channel_id: "room.a".to_string(),
            key: "public.scores.alice".to_string(),
            value: Some(json!(7)),
        }
    );

    manager.handle_disconnect();
    assert!(!manager.get_channel("room.a").unwrap().got_subscription);
}

#[tokio::test]
async fn predictive_write_updates_mirror_before_the_server_answers() {
    let (link, manager) = manager();
    link.expect_request("subscribe").return_ok(Value::Null);
    link.expect_request("set_channel_data").return_ok(Value::Null);
    manager.handle_connect("u1").await;
    manager.subscribe("room.a").await.unwrap();

    manager
        .set_channel_data("room.a", "public.score", Some(json!(3)), true)
        .await
        .unwrap();

    assert_eq!(manager.get_channel_data("room.a", "public.score"), Some(json!(3)));
    let (msg, data) = link.requests().pop().unwrap();
    assert_eq!(msg, "set_channel_data");
    assert_eq!(
        data,
        json!({ "channel_id": "room.a", "key": "public.score", "value": 3, "pred": true })
    );
}

#[tokio::test]
async fn login_is_replayed_after_reconnect() {
    let (link, manager) = manager();
    link.expect_request("login").return_ok(json!({ "display_name": "Alice" }));
    link.expect_request("login").return_ok(json!({ "display_name": "Alice" }));
    manager.handle_connect("u1").await;

    assert_eq!(manager.login("alice", "hunter2").await.unwrap(), "Alice");
    assert_eq!(
        manager.logged_in(),
        Some(("alice".to_string(), "Alice".to_string()))
    );

    manager.handle_disconnect();
    assert_eq!(manager.logged_in(), None);
    manager.handle_connect("u2").await;

    link.verify();
    let logins: Vec<Value> = link
        .requests()
        .into_iter()
        .filter(|(msg, _)| msg == "login")
        .map(|(_, data)| data)
        .collect();
    let expected = json!({ "name": "alice", "password": prehash("alice", "hunter2") });
    assert_eq!(logins, vec![expected.clone(), expected]);
    assert!(manager.logged_in().is_some());
}

#[tokio::test]
async fn stored_credentials_that_fail_are_forgotten() {
    let store = Arc::new(MemoryStore::new());
    let creds = json!({ "name": "alice", "password": prehash("alice", "old") });
    store.set(CREDENTIALS_KEY, &creds).unwrap();

    let link = Arc::new(MockLink::new());
    link.expect_request("login")
        .return_err(FabricError::Remote("invalid password".to_string()));
    let manager = SubscriptionManager::new(link.clone()).with_credentials_store(store.clone());
    let mut events = manager.events();

    manager.handle_connect("u1").await;

    link.verify();
    assert_eq!(store.get(CREDENTIALS_KEY).unwrap(), Some(Value::Null));
    assert!(matches!(events.try_recv().unwrap(), MirrorEvent::Connected { reconnect: false, .. }));
    assert_eq!(
        events.try_recv().unwrap(),
        MirrorEvent::LoginFailed { err: "invalid password".to_string() }
    );

    // Next connect does not try again.
    manager.handle_disconnect();
    manager.handle_connect("u2").await;
    assert_eq!(link.requests().len(), 1);
}

#[tokio::test]
async fn logout_requires_a_login() {
    let (link, manager) = manager();
    manager.handle_connect("u1").await;
    assert!(matches!(manager.logout().await, Err(FabricError::NotLoggedIn)));

    link.expect_request("login").return_ok(json!({ "display_name": "Bob" }));
    link.expect_request("logout").return_ok(Value::Null);
    manager.login("bob", "pw").await.unwrap();
    manager.logout().await.unwrap();

    link.verify();
    assert_eq!(manager.logged_in(), None);
}

#[tokio::test]
async fn cmd_parse_falls_through_to_subscribed_channels() {
    let (link, manager) = manager();
    link.expect_request("subscribe").return_ok(Value::Null);
    manager.handle_connect("u1").await;
    manager.subscribe("room.a").await.unwrap();

    link.expect_request("cmdparse")
        .return_ok(json!({ "found": false, "err": "Unknown command: \"topic\"" }));
    link.expect_request("channel_msg")
        .return_ok(json!({ "found": true, "resp": "Topic is now tea" }));
    assert_eq!(manager.send_cmd_parse("topic tea").await, Ok("Topic is now tea".to_string()));

    link.expect_request("cmdparse")
        .return_ok(json!({ "found": false, "err": "Unknown command: \"dance\"" }));
    link.expect_request("channel_msg")
        .return_ok(json!({ "found": false, "err": "Unknown command: \"dance\"" }));
    assert_eq!(
        manager.send_cmd_parse("dance").await,
        Err("Unknown command: \"dance\"".to_string())
    );
    link.verify();
}

#[tokio::test]
async fn server_time_ignores_small_backward_corrections() {
    let (_link, manager) = manager();
    manager.handle_server_time(1_000);
    manager.tick(50);
    manager.handle_server_time(900);
    assert_eq!(manager.server_time(), 1_050);

    manager.handle_server_time(500);
    assert_eq!(manager.server_time(), 500);
}
