//! The `client.u<id>` channel: one per live socket.
//!
//! It is the socket's proxy inside the fabric. Requests arriving on the socket are
//! validated and turned into channel messages sent under the client's identity;
//! messages other channels send to it are forwarded to the socket as `channel_msg`,
//! and answers flow back the same way.

use crate::ack::{read_envelope, write_envelope, AckState, Incoming, Msg, Payload, Reply, ReplySink, Responder, ResponseMode};
use crate::behavior::{ChannelBehavior, REPLICATION_MESSAGES};
use crate::channel::{ChannelId, SenderIds, Source, CLIENT_TYPE, USER_TYPE};
use crate::data::DataPath;
use crate::error::{ERR_DISCONNECTED, ERR_INVALID_CHANNEL_ID, ERR_NOT_LOGGED_IN};
use crate::net::{Connection, ConnectionEvent};
use crate::packet::Packet;
use crate::registry::{Builtin, ChannelType};
use crate::worker::ChannelWorker;
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Default)]
pub struct ClientChannel {
    conn: Option<Connection>,
    /// Requests forwarded to the socket, keyed by the responder to relay into.
    conn_ack: AckState<Responder>,
}

type Worker = ChannelWorker<ClientChannel>;

pub(crate) fn channel_type() -> ChannelType<ClientChannel> {
    ChannelType::new(CLIENT_TYPE, |_| ClientChannel::default())
        .cmd("whoami", cmd_whoami)
        .cmd("channels", cmd_channels)
}

fn cmd_whoami(w: &mut Worker, _args: &str) -> Result<String, String> {
    let ids = w.ids();
    Ok(match (&ids.user_id, &ids.display_name) {
        (Some(user_id), Some(name)) => format!("{} ({user_id}) on {}", name, w.id()),
        (Some(user_id), None) => format!("{user_id} on {}", w.id()),
        _ => format!("Not logged in, on {}", w.id()),
    })
}

fn cmd_channels(w: &mut Worker, _args: &str) -> Result<String, String> {
    let subs: Vec<&str> = w.subscriptions().collect();
    Ok(subs.join(", "))
}

/// Names a socket may not send through `channel_msg`.
fn is_reserved(msg: &str) -> bool {
    match msg.parse::<Builtin>() {
        Ok(builtin) => builtin != Builtin::CmdParse,
        Err(()) => REPLICATION_MESSAGES.contains(&msg),
    }
}

fn valid_username(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ChannelBehavior for ClientChannel {
    fn on_connection_event(w: &mut Worker, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Attached(conn) => {
                conn.send_message("internal_client_id", json!(w.id().subid()));
                w.app.conn = Some(conn);
            }
            ConnectionEvent::Frame(pak) => handle_frame(w, pak),
            ConnectionEvent::Closed => {
                debug!(channel_id = %w.id(), "Socket closed");
                w.app.conn = None;
                w.unsubscribe_all();
                for pending in w.app.conn_ack.fail_all() {
                    pending.callback.fail(ERR_DISCONNECTED);
                }
                w.destroy();
            }
        }
    }

    /// Everything not handled here goes to the socket.
    fn on_unhandled(w: &mut Worker, source: &Source, msg: &str, data: Value, responder: Responder) {
        let Some(conn) = w.app.conn.clone() else {
            return responder.fail(ERR_DISCONNECTED);
        };
        let payload = json!({
            "channel_id": source.channel_id.as_str(),
            "msg": msg,
            "data": data,
        });
        let mode = if responder.expects_response() {
            ResponseMode::Expect(responder)
        } else {
            ResponseMode::FireAndForget
        };
        let mut pak = Packet::create(0, 64);
        w.app
            .conn_ack
            .wrap_message(&mut pak, Msg::name("channel_msg"), None, Payload::Json(payload), mode);
        pak.make_readable();
        conn.send_packet(pak);
    }
}

fn socket_sink(w: &Worker) -> ReplySink {
    let conn = w.app.conn.clone();
    Box::new(move |reply: Reply| {
        let Some(conn) = conn else {
            return;
        };
        let mut pak = Packet::create(0, 32);
        write_envelope(&mut pak, &reply.msg, None, reply.err.as_deref(), reply.data);
        pak.make_readable();
        conn.send_packet(pak);
    })
}

fn handle_frame(w: &mut Worker, mut pak: Packet) {
    let env = match read_envelope(&mut pak) {
        Ok(env) => env,
        Err(e) => return w.on_error(&format!("Malformed frame on {}: {e}", w.id())),
    };
    let sink = socket_sink(w);
    let source = w.id().to_string();
    let incoming = match w.app.conn_ack.handle_message(&source, env, sink) {
        Ok(incoming) => incoming,
        Err(e) => return w.on_error(&e.to_string()),
    };
    match incoming {
        Incoming::Request { msg, data, responder } => {
            debug!(channel_id = %w.id(), %msg, "socket request");
            handle_socket_request(w, &msg, data.into_json(), responder);
        }
        Incoming::Response { pending, err, data, .. } => pending.callback.respond(err, data),
    }
}

fn handle_socket_request(w: &mut Worker, msg: &str, data: Value, responder: Responder) {
    match msg {
        "subscribe" => on_subscribe(w, data, responder),
        "unsubscribe" => on_unsubscribe(w, data, responder),
        "set_channel_data" | "set_channel_data_if" | "set_channel_data_push" => {
            on_set_channel_data(w, msg, data, responder)
        }
        "channel_msg" => on_channel_msg(w, data, responder),
        "login" => on_login(w, data, responder),
        "logout" => on_logout(w, responder),
        "cmdparse" => {
            let input = data.as_str().unwrap_or_default().to_string();
            let reply = w.cmd_parse(&input);
            responder.ok(reply);
        }
        _ => responder.fail(format!("No handler registered for \"{msg}\"")),
    }
}

fn target_channel(data: &Value) -> Result<ChannelId, String> {
    data.as_str()
        .or_else(|| data.get("channel_id").and_then(Value::as_str))
        .ok_or_else(|| "Missing channel_id".to_string())
        .and_then(|id| ChannelId::parse(id).map_err(|_| ERR_INVALID_CHANNEL_ID.to_string()))
}

fn on_subscribe(w: &mut Worker, data: Value, responder: Responder) {
    let target = match target_channel(&data) {
        Ok(target) => target,
        Err(err) => return responder.fail(err),
    };
    w.subscribe_other_with(target.as_str(), move |_, res| responder.result(res.map(|_| Value::Null)));
}

fn on_unsubscribe(w: &mut Worker, data: Value, responder: Responder) {
    let target = match target_channel(&data) {
        Ok(target) => target,
        Err(err) => return responder.fail(err),
    };
    match w.unsubscribe_other(target.as_str()) {
        Ok(()) => responder.done(),
        Err(e) => responder.fail(e.code()),
    }
}

fn on_set_channel_data(w: &mut Worker, msg: &str, mut data: Value, responder: Responder) {
    let target = match target_channel(&data) {
        Ok(target) => target,
        Err(err) => return responder.fail(err),
    };
    let key = data.get("key").and_then(Value::as_str).unwrap_or_default();
    if let Err(e) = key.parse::<DataPath>() {
        return responder.fail(e.to_string());
    }
    if !w.is_subscribed_to(target.as_str()) {
        return responder.fail(format!("Client is not on channel {target}"));
    }
    if let Value::Object(map) = &mut data {
        map.remove("channel_id");
    }
    w.request(target.as_str(), msg, data, move |_, res| responder.result(res));
}

fn on_channel_msg(w: &mut Worker, data: Value, responder: Responder) {
    let target = match target_channel(&data) {
        Ok(target) => target,
        Err(err) => return responder.fail(err),
    };
    let Some(msg) = data.get("msg").and_then(Value::as_str).map(str::to_string) else {
        return responder.fail("Missing msg");
    };
    if is_reserved(&msg) {
        return responder.fail(format!("Not allowed to send internal message {msg}"));
    }
    if !w.is_subscribed_to(target.as_str()) {
        return responder.fail(format!("Client is not on channel {target}"));
    }
    let payload = data.get("data").cloned().unwrap_or(Value::Null);
    let (msg, payload) = if data.get("broadcast").and_then(Value::as_bool).unwrap_or(false) {
        if !payload.is_object() {
            return responder.fail("Broadcast requires data object");
        }
        (Builtin::Broadcast.name().to_string(), json!({ "msg": msg, "data": payload }))
    } else {
        (msg, payload)
    };
    if responder.expects_response() {
        w.request(target.as_str(), &msg, payload, move |_, res| responder.result(res));
    } else {
        w.send(target.as_str(), &msg, payload);
    }
}

fn notify_client_changed(w: &mut Worker) {
    let targets: Vec<String> = w.subscriptions().map(str::to_string).collect();
    for target in targets {
        w.send(&target, Builtin::ClientChanged.name(), Value::Null);
    }
}

fn on_login(w: &mut Worker, data: Value, responder: Responder) {
    let name = data.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    if !valid_username(&name) {
        return responder.fail("invalid username");
    }
    if w.ids().user_id.is_some() {
        return responder.fail("Already logged in");
    }
    let password = data.get("password").cloned().unwrap_or(Value::Null);
    let user_channel = format!("{USER_TYPE}.{name}");
    let dest = user_channel.clone();
    w.request(&dest, "login", json!({ "password": password }), move |w, res| {
        let resp = match res {
            Ok(resp) => resp,
            Err(err) => return responder.fail(err),
        };
        let display_name = resp
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or(&name)
            .to_string();
        let mut ids = w.ids().clone();
        ids.user_id = Some(name.clone());
        ids.display_name = Some(display_name.clone());
        w.set_ids(ids);
        info!(channel_id = %w.id(), user_id = %name, "Logged in");
        notify_client_changed(w);
        w.subscribe_other(&user_channel);
        responder.ok(json!({ "display_name": display_name }));
    });
}

fn on_logout(w: &mut Worker, responder: Responder) {
    let Some(user_id) = w.ids().user_id.clone() else {
        return responder.fail(ERR_NOT_LOGGED_IN);
    };
    let _ = w.unsubscribe_other(&format!("{USER_TYPE}.{user_id}"));
    let ids = SenderIds {
        client_id: w.ids().client_id.clone(),
        ..SenderIds::default()
    };
    w.set_ids(ids);
    info!(channel_id = %w.id(), %user_id, "Logged out");
    notify_client_changed(w);
    responder.done();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved("subscribe"));
        assert!(is_reserved("set_channel_data"));
        assert!(is_reserved("apply_channel_data"));
        assert!(!is_reserved("cmdparse"));
        assert!(!is_reserved("chat"));
    }

    #[test]
    fn usernames() {
        assert!(valid_username("Big_Bob42"));
        assert!(!valid_username(""));
        assert!(!valid_username("bob smith"));
        assert!(!valid_username("bob.smith"));
    }

    #[test]
    fn target_from_string_or_object() {
        assert_eq!(target_channel(&json!("room.1")).unwrap().as_str(), "room.1");
        assert_eq!(
            target_channel(&json!({ "channel_id": "room.2", "key": "public.x" })).unwrap().as_str(),
            "room.2"
        );
        assert_eq!(target_channel(&json!("room")).unwrap_err(), ERR_INVALID_CHANNEL_ID);
        assert_eq!(target_channel(&json!({})).unwrap_err(), "Missing channel_id");
    }
}
