//! Chat rooms: `room.<name>`, created on first join and destroyed when the last
//! member leaves. Membership is mirrored into `public.clients` for every subscriber.

use channel_fabric::{ChannelBehavior, ChannelType, ChannelWorker, Responder, Source};
use serde_json::{json, Value};
use tracing::debug;

pub const ROOM_TYPE: &str = "room";
pub const MAX_MSG_LEN: usize = 1000;

pub struct RoomChannel;

type Worker = ChannelWorker<RoomChannel>;

pub fn channel_type() -> ChannelType<RoomChannel> {
    ChannelType::new(ROOM_TYPE, |_| RoomChannel)
        .autocreate()
        .auto_destroy()
        .maintain_client_list()
        .emit_join_leave_events()
        .handler("chat", on_chat)
        .cmd("topic", cmd_topic)
        .cmd("who", cmd_who)
}

impl ChannelBehavior for RoomChannel {}

fn on_chat(w: &mut Worker, src: &Source, data: Value, responder: Responder) {
    let Some(msg) = data.get("msg").and_then(Value::as_str) else {
        return responder.fail("Missing msg");
    };
    let msg = msg.trim();
    if msg.is_empty() {
        return responder.fail("Empty message");
    }
    if msg.len() > MAX_MSG_LEN {
        return responder.fail("Message too long");
    }
    debug!(room = %w.id(), from = %src.channel_id, "Chat");
    w.channel_emit("chat", json!({ "msg": msg, "client_ids": src.ids }), None);
    responder.done();
}

fn cmd_topic(w: &mut Worker, args: &str) -> Result<String, String> {
    if args.is_empty() {
        return match w.get_channel_data("public.topic").and_then(Value::as_str) {
            Some(topic) => Ok(format!("Topic is {topic}")),
            None => Err("No topic set".to_string()),
        };
    }
    w.set_channel_data("public.topic", Some(json!(args)))
        .map_err(|e| e.to_string())?;
    Ok(format!("Topic is now {args}"))
}

fn cmd_who(w: &mut Worker, _args: &str) -> Result<String, String> {
    let Some(clients) = w.get_channel_data("public.clients").and_then(Value::as_object) else {
        return Ok("Nobody here".to_string());
    };
    let mut names: Vec<&str> = clients
        .iter()
        .map(|(subid, entry)| {
            entry
                .pointer("/ids/display_name")
                .or_else(|| entry.pointer("/ids/user_id"))
                .and_then(Value::as_str)
                .unwrap_or(subid.as_str())
        })
        .collect();
    names.sort_unstable();
    Ok(format!("{} here: {}", names.len(), names.join(", ")))
}
