use channel_fabric::{
    ChannelBehavior, ChannelServer, ChannelSnapshot, ChannelType, ChannelWorker, FabricError, LocalExchange,
    MemoryStore, Responder, ServerConfig, Source,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Records everything it does not handle into `private.log`.
struct Agent;

impl ChannelBehavior for Agent {
    fn on_unhandled(w: &mut ChannelWorker<Self>, source: &Source, msg: &str, data: Value, responder: Responder) {
        let mut log = w.get_channel_data("private.log").cloned().unwrap_or_else(|| json!([]));
        if let Value::Array(items) = &mut log {
            items.push(json!({ "from": source.channel_id.as_str(), "msg": msg, "data": data }));
        }
        w.set_channel_data("private.log", Some(log)).unwrap();
        responder.done();
    }
}

fn subscribe_to(w: &mut ChannelWorker<Agent>, _src: &Source, data: Value, responder: Responder) {
    let target = data.as_str().unwrap_or_default().to_string();
    w.subscribe_other_with(&target, move |_, res| responder.result(res.map(|_| Value::Null)));
}

fn unsubscribe_from(w: &mut ChannelWorker<Agent>, _src: &Source, data: Value, responder: Responder) {
    let target = data.as_str().unwrap_or_default();
    responder.result(w.unsubscribe_other(target).map(|_| Value::Null).map_err(|e| e.code()));
}

fn ignore(_w: &mut ChannelWorker<Agent>, _src: &Source, _data: Value, responder: Responder) {
    drop(responder);
}

struct Room;

impl ChannelBehavior for Room {}

fn bump(w: &mut ChannelWorker<Room>, _src: &Source, _data: Value, responder: Responder) {
    let n = w.get_channel_data("public.count").and_then(Value::as_u64).unwrap_or(0) + 1;
    w.set_channel_data("public.count", Some(json!(n))).unwrap();
    responder.ok(json!(n));
}

fn boom(_w: &mut ChannelWorker<Room>, _src: &Source, _data: Value, _responder: Responder) {
    panic!("kaboom");
}

fn cmd_topic(w: &mut ChannelWorker<Room>, args: &str) -> Result<String, String> {
    if args.is_empty() {
        return Err("Missing topic".to_string());
    }
    w.set_channel_data("public.topic", Some(json!(args)))
        .map_err(|e| e.to_string())?;
    Ok(format!("Topic is now {args}"))
}

fn server_with(config: ServerConfig) -> ChannelServer {
    let server = ChannelServer::new(Arc::new(LocalExchange::new()), Arc::new(MemoryStore::new()), config);
    server
        .register_channel_type(
            ChannelType::new("agent", |_| Agent)
                .handler("subscribe_to", subscribe_to)
                .handler("unsubscribe_from", unsubscribe_from)
                .handler("ignore", ignore),
        )
        .unwrap();
    server
        .register_channel_type(
            ChannelType::new("room", |_| Room)
                .autocreate()
                .emit_join_leave_events()
                .subid_validator(|subid| !subid.contains(' '))
                .handler("bump", bump)
                .handler("boom", boom)
                .cmd("topic", cmd_topic),
        )
        .unwrap();
    server
        .register_channel_type(ChannelType::new("lobby", |_| Room).autocreate().auto_destroy())
        .unwrap();
    server
}

async fn setup(agents: &[&str]) -> ChannelServer {
    let server = server_with(ServerConfig::default());
    for id in agents {
        server.create_channel_local(id).await.unwrap();
    }
    server
}

async fn wait_for(server: &ChannelServer, id: &str, pred: impl Fn(&ChannelSnapshot) -> bool) -> ChannelSnapshot {
    for _ in 0..300 {
        if let Ok(snapshot) = server.inspect(id).await {
            if pred(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{id} never reached the expected state");
}

fn log(snapshot: &ChannelSnapshot) -> Vec<Value> {
    snapshot
        .data
        .private
        .get("log")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn entries<'a>(log: &'a [Value], msg: &str) -> Vec<&'a Value> {
    log.iter().filter(|e| e["msg"] == msg).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_contact_creates_one_instance() {
    let server = setup(&["agent.a", "agent.b"]).await;

    let (a, b) = tokio::join!(
        server.request_from("agent.a", "room.race", "bump", Value::Null),
        server.request_from("agent.b", "room.race", "bump", Value::Null),
    );
    let mut counts = vec![a.unwrap(), b.unwrap()];
    counts.sort_by_key(|v| v.as_u64());

    assert_eq!(counts, vec![json!(1), json!(2)]);
    assert_eq!(server.channels_by_type("room"), vec!["room.race".to_string()]);
    server.shutdown().await;
}

#[tokio::test]
async fn routing_failures_surface_as_typed_errors() {
    let server = setup(&["agent.a"]).await;

    let unknown = server.request_from("agent.a", "nosuch.x", "hi", Value::Null).await;
    assert!(matches!(unknown, Err(FabricError::UnknownChannelType)));

    let malformed = server.request_from("agent.a", "room", "hi", Value::Null).await;
    assert!(matches!(malformed, Err(FabricError::InvalidChannelId)));

    let rejected = server.request_from("agent.a", "room.bad id", "bump", Value::Null).await;
    assert!(matches!(rejected, Err(FabricError::InvalidChannelId)));

    // agent is not auto-created
    let missing = server.request_from("agent.a", "agent.missing", "hi", Value::Null).await;
    assert!(matches!(missing, Err(FabricError::NotFound)));
    assert!(!server.has_channel("agent.missing"));

    let unhandled = server.request_from("agent.a", "room.x", "nosuch", Value::Null).await;
    assert!(matches!(unhandled, Err(FabricError::Remote(e)) if e == "No handler registered for \"nosuch\""));
    server.shutdown().await;
}

#[tokio::test]
async fn subscriptions_are_refcounted() {
    let server = setup(&["agent.a"]).await;

    for _ in 0..2 {
        server
            .request_from("agent.a", "agent.a", "subscribe_to", json!("room.r"))
            .await
            .unwrap();
    }
    let room = server.inspect("room.r").await.unwrap();
    assert_eq!(room.subscribers, vec!["agent.a".to_string()]);
    let agent = server.inspect("agent.a").await.unwrap();
    assert_eq!(agent.subscriptions.get("room.r"), Some(&2));
    assert_eq!(entries(&log(&agent), "channel_data").len(), 1);

    server
        .request_from("agent.a", "agent.a", "unsubscribe_from", json!("room.r"))
        .await
        .unwrap();
    let room = server.inspect("room.r").await.unwrap();
    assert_eq!(room.subscribers, vec!["agent.a".to_string()]);

    server
        .request_from("agent.a", "agent.a", "unsubscribe_from", json!("room.r"))
        .await
        .unwrap();
    wait_for(&server, "room.r", |room| room.subscribers.is_empty()).await;
    let agent = server.inspect("agent.a").await.unwrap();
    assert!(agent.subscriptions.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn joins_are_announced_to_existing_subscribers() {
    let server = setup(&["agent.a", "agent.b"]).await;
    server
        .request_from("agent.a", "agent.a", "subscribe_to", json!("room.j"))
        .await
        .unwrap();
    server
        .request_from("agent.b", "agent.b", "subscribe_to", json!("room.j"))
        .await
        .unwrap();

    let a = wait_for(&server, "agent.a", |s| !entries(&log(s), "join").is_empty()).await;
    let log_a = log(&a);
    let joins = entries(&log_a, "join");
    assert_eq!(joins[0]["data"]["client_id"], "agent.b");

    server
        .request_from("agent.b", "agent.b", "unsubscribe_from", json!("room.j"))
        .await
        .unwrap();
    let a = wait_for(&server, "agent.a", |s| !entries(&log(s), "leave").is_empty()).await;
    assert_eq!(entries(&log(&a), "leave")[0]["data"]["client_id"], "agent.b");
    server.shutdown().await;
}

#[tokio::test]
async fn public_writes_skip_the_predicting_writer() {
    let server = setup(&["agent.a", "agent.b"]).await;
    for agent in ["agent.a", "agent.b"] {
        server
            .request_from(agent, agent, "subscribe_to", json!("room.p"))
            .await
            .unwrap();
    }

    server
        .request_from(
            "agent.a",
            "room.p",
            "set_channel_data",
            json!({ "key": "public.topic", "value": "rust", "pred": true }),
        )
        .await
        .unwrap();
    server
        .request_from("agent.a", "room.p", "set_channel_data", json!({ "key": "private.secret", "value": 42 }))
        .await
        .unwrap();
    server
        .request_from("agent.a", "room.p", "set_channel_data", json!({ "key": "public.after", "value": true }))
        .await
        .unwrap();

    let b = wait_for(&server, "agent.b", |s| entries(&log(s), "apply_channel_data").len() == 2).await;
    let log_b = log(&b);
    let keys: Vec<&Value> = entries(&log_b, "apply_channel_data")
        .into_iter()
        .map(|e| &e["data"]["key"])
        .collect();
    assert_eq!(keys, vec!["public.topic", "public.after"]);

    let a = server.inspect("agent.a").await.unwrap();
    let log_a = log(&a);
    let keys: Vec<&Value> = entries(&log_a, "apply_channel_data")
        .into_iter()
        .map(|e| &e["data"]["key"])
        .collect();
    assert_eq!(keys, vec!["public.after"]);

    let stored = server.store().get("room/room.p").unwrap().unwrap();
    assert_eq!(stored["private"]["secret"], 42);
    assert_eq!(stored["public"]["topic"], "rust");
    server.shutdown().await;
}

#[tokio::test]
async fn conditional_and_push_writes() {
    let server = setup(&["agent.a"]).await;
    let set_if = |value: Value, expected: Value| {
        json!({ "key": "public.owner", "value": value, "set_if": expected })
    };

    server
        .request_from("agent.a", "room.w", "set_channel_data_if", set_if(json!("a"), Value::Null))
        .await
        .unwrap();
    let stale = server
        .request_from("agent.a", "room.w", "set_channel_data_if", set_if(json!("b"), Value::Null))
        .await;
    assert!(matches!(stale, Err(FabricError::Remote(e)) if e == "ERR_SETIF_MISMATCH"));
    server
        .request_from("agent.a", "room.w", "set_channel_data_if", set_if(json!("b"), json!("a")))
        .await
        .unwrap();

    for expected in 0..2 {
        let reply = server
            .request_from("agent.a", "room.w", "set_channel_data_push", json!({ "key": "public.list", "value": expected }))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "index": expected }));
    }
    let not_array = server
        .request_from("agent.a", "room.w", "set_channel_data_push", json!({ "key": "public.owner", "value": 1 }))
        .await;
    assert!(matches!(not_array, Err(FabricError::Remote(e)) if e == "ERR_NOT_ARRAY"));

    let room = server.inspect("room.w").await.unwrap();
    assert_eq!(room.data.public["owner"], "b");
    assert_eq!(room.data.public["list"], json!([0, 1]));
    server.shutdown().await;
}

#[tokio::test]
async fn console_commands_run_against_the_channel() {
    let server = setup(&["agent.a"]).await;

    let reply = server
        .request_from("agent.a", "room.c", "cmdparse", json!("Topic  rust talk"))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "found": true, "resp": "Topic is now rust talk" }));

    let missing = server
        .request_from("agent.a", "room.c", "cmdparse", json!("topic"))
        .await
        .unwrap();
    assert_eq!(missing, json!({ "found": true, "err": "Missing topic" }));

    let unknown = server
        .request_from("agent.a", "room.c", "cmdparse", json!("dance"))
        .await
        .unwrap();
    assert_eq!(unknown["found"], false);
    server.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_is_reported_and_channel_survives() {
    let config = ServerConfig {
        admin_channel: Some("agent.admin".to_string()),
        ..ServerConfig::default()
    };
    let server = server_with(config);
    server.create_channel_local("agent.admin").await.unwrap();
    server.create_channel_local("agent.a").await.unwrap();

    server.send_from("agent.a", "room.crash", "boom", Value::Null).unwrap();

    let admin = wait_for(&server, "agent.admin", |s| !entries(&log(s), "crash").is_empty()).await;
    let log_admin = log(&admin);
    let crashes = entries(&log_admin, "crash");
    let report = &crashes[0]["data"];
    assert_eq!(report["channel_id"], "room.crash");
    assert_eq!(report["reason"], "kaboom");
    assert!(report["history"][0].as_str().unwrap().contains("boom"));

    let n = server
        .request_from("agent.a", "room.crash", "bump", Value::Null)
        .await
        .unwrap();
    assert_eq!(n, json!(1));
    server.shutdown().await;
}

#[tokio::test]
async fn destroyed_channels_reload_from_the_store() {
    let server = setup(&["agent.a"]).await;
    server
        .request_from("agent.a", "room.keep", "set_channel_data", json!({ "key": "public.topic", "value": "kept" }))
        .await
        .unwrap();

    server.destroy_channel("room.keep").await;
    assert!(!server.has_channel("room.keep"));
    assert!(matches!(server.inspect("room.keep").await, Err(FabricError::NotFound)));

    server
        .request_from("agent.a", "room.keep", "bump", Value::Null)
        .await
        .unwrap();
    let room = server.inspect("room.keep").await.unwrap();
    assert_eq!(room.data.public["topic"], "kept");
    server.shutdown().await;
}

#[tokio::test]
async fn auto_destroy_when_last_subscriber_leaves() {
    let server = setup(&["agent.a"]).await;
    server
        .request_from("agent.a", "agent.a", "subscribe_to", json!("lobby.x"))
        .await
        .unwrap();
    assert!(server.has_channel("lobby.x"));

    server
        .request_from("agent.a", "agent.a", "unsubscribe_from", json!("lobby.x"))
        .await
        .unwrap();
    for _ in 0..300 {
        if !server.has_channel("lobby.x") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!server.has_channel("lobby.x"));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_racing_the_last_leave_is_kept() {
    let server = setup(&["agent.a", "agent.b"]).await;

    for i in 0..50 {
        let lobby = format!("lobby.r{i}");
        server
            .request_from("agent.a", "agent.a", "subscribe_to", json!(lobby))
            .await
            .unwrap();

        let (left, joined) = tokio::join!(
            server.request_from("agent.a", "agent.a", "unsubscribe_from", json!(lobby)),
            server.request_from("agent.b", "agent.b", "subscribe_to", json!(lobby)),
        );
        left.unwrap();
        joined.unwrap();

        // Either the old instance kept b or a fresh one was created for it.
        wait_for(&server, &lobby, |l| l.subscribers == vec!["agent.b".to_string()]).await;
        let b = server.inspect("agent.b").await.unwrap();
        assert_eq!(b.subscriptions.get(&lobby), Some(&1));
    }
    server.shutdown().await;
}

#[tokio::test]
async fn packet_counters_restart_with_a_recreated_channel() {
    let server = setup(&["agent.a"]).await;
    server
        .request_from("agent.a", "agent.a", "subscribe_to", json!("lobby.x"))
        .await
        .unwrap();
    let agent = server.inspect("agent.a").await.unwrap();
    let sent = agent.send_pkt_idx["lobby.x"];
    let lobby = wait_for(&server, "lobby.x", |l| l.recv_pkt_idx.get("agent.a") == Some(&sent)).await;
    let lobby_sent = lobby.send_pkt_idx["agent.a"];
    wait_for(&server, "agent.a", |a| a.recv_pkt_idx.get("lobby.x") == Some(&lobby_sent)).await;

    server
        .request_from("agent.a", "agent.a", "unsubscribe_from", json!("lobby.x"))
        .await
        .unwrap();
    for _ in 0..300 {
        if !server.has_channel("lobby.x") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!server.has_channel("lobby.x"));
    wait_for(&server, "agent.a", |a| {
        !a.send_pkt_idx.contains_key("lobby.x") && !a.recv_pkt_idx.contains_key("lobby.x")
    })
    .await;

    server
        .request_from("agent.a", "agent.a", "subscribe_to", json!("lobby.x"))
        .await
        .unwrap();
    let agent = server.inspect("agent.a").await.unwrap();
    assert_eq!(agent.send_pkt_idx.get("lobby.x"), Some(&1));
    let lobby = server.inspect("lobby.x").await.unwrap();
    assert_eq!(lobby.recv_pkt_idx.get("agent.a"), Some(&1));
    server.shutdown().await;
}

#[tokio::test]
async fn failed_sends_do_not_advance_the_counter() {
    let server = setup(&["agent.a"]).await;

    for _ in 0..2 {
        let missing = server.request_from("agent.a", "agent.late", "hello", Value::Null).await;
        assert!(matches!(missing, Err(FabricError::NotFound)));
    }
    let agent = server.inspect("agent.a").await.unwrap();
    assert!(!agent.send_pkt_idx.contains_key("agent.late"));

    server.create_channel_local("agent.late").await.unwrap();
    server
        .request_from("agent.a", "agent.late", "hello", Value::Null)
        .await
        .unwrap();
    let late = server.inspect("agent.late").await.unwrap();
    assert_eq!(late.recv_pkt_idx.get("agent.a"), Some(&1));
    assert_eq!(entries(&log(&late), "hello").len(), 1);
    let agent = server.inspect("agent.a").await.unwrap();
    assert_eq!(agent.send_pkt_idx.get("agent.late"), Some(&1));
    server.shutdown().await;
}

#[tokio::test]
async fn unanswered_requests_expire_with_a_ttl() {
    let config = ServerConfig {
        rpc_ttl_secs: Some(0),
        ..ServerConfig::default()
    };
    let server = server_with(config);
    server.create_channel_local("agent.a").await.unwrap();
    server.create_channel_local("agent.mute").await.unwrap();

    let pending = {
        let server = server.clone();
        tokio::spawn(async move { server.request_from("agent.a", "agent.mute", "ignore", Value::Null).await })
    };
    while !pending.is_finished() {
        server.do_tick();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(pending.await.unwrap(), Err(FabricError::Timeout)));
    server.shutdown().await;
}

#[tokio::test]
async fn registration_rejects_duplicates() {
    let server = setup(&[]).await;
    let again = server.register_channel_type(ChannelType::new("room", |_| Room));
    assert!(matches!(again, Err(FabricError::DuplicateChannelType(name)) if name == "room"));

    let clash = server.register_channel_type(ChannelType::new("hall", |_| Room).handler("broadcast", bump));
    assert!(matches!(clash, Err(FabricError::DuplicateHandler { name, .. }) if name == "broadcast"));
}

#[tokio::test]
async fn shutdown_stops_everything_and_blocks_autocreate() {
    let server = setup(&["agent.a"]).await;
    server
        .request_from("agent.a", "room.s", "bump", Value::Null)
        .await
        .unwrap();

    server.shutdown().await;
    assert!(server.channels_by_type("room").is_empty());
    assert!(matches!(
        server.request_from("agent.a", "room.s", "bump", Value::Null).await,
        Err(FabricError::NotFound)
    ));
}
