//! # User Channel
//!
//! One `user.<name>` channel per account. It is auto-created the first time anything
//! talks to it, so the first successful `login` is also account creation.
//!
//! ## Data
//!
//! - `private.password`: the prehashed password from the first login
//! - `public.display_name`: starts out as the user name, changed with `rename`
//!
//! ## Usage
//!
//! ```rust
//! use channel_fabric::{ChannelServer, LocalExchange, MemoryStore, ServerConfig};
//! use channel_sample::user_channel;
//! use std::sync::Arc;
//!
//! let server = ChannelServer::new(
//!     Arc::new(LocalExchange::new()),
//!     Arc::new(MemoryStore::new()),
//!     ServerConfig::default(),
//! );
//! server.register_channel_type(user_channel::channel_type()).unwrap();
//! ```
//!
//! ## Permissions
//!
//! Other channels may write any key. Client channels may only write to the user
//! channel of the user they are logged in as.

use channel_fabric::channel::USER_TYPE;
use channel_fabric::data::DataPath;
use channel_fabric::{ChannelBehavior, ChannelType, ChannelWorker, Responder, Source};
use serde_json::{json, Value};
use tracing::info;

pub struct UserChannel;

type Worker = ChannelWorker<UserChannel>;

pub fn channel_type() -> ChannelType<UserChannel> {
    ChannelType::new(USER_TYPE, |_| UserChannel)
        .autocreate()
        .handler("login", on_login)
        .cmd("rename", cmd_rename)
}

impl ChannelBehavior for UserChannel {
    fn on_set_channel_data(w: &Worker, source: &Source, _key: &DataPath, _value: Option<&Value>) -> bool {
        !source.is_client() || source.user_id() == Some(w.id().subid())
    }
}

fn write(w: &mut Worker, key: &str, value: Value) -> Result<(), String> {
    w.set_channel_data(key, Some(value)).map_err(|e| e.to_string())
}

fn on_login(w: &mut Worker, _src: &Source, data: Value, responder: Responder) {
    let password = match data.get("password").and_then(Value::as_str) {
        Some(password) if !password.is_empty() => password.to_string(),
        _ => return responder.fail("missing password"),
    };
    if w.get_channel_data("private.password").is_none() {
        let user_id = w.id().subid().to_string();
        info!(%user_id, "Creating account");
        let created = write(w, "private.password", json!(password))
            .and_then(|()| write(w, "public.display_name", json!(user_id)));
        if let Err(err) = created {
            return responder.fail(err);
        }
    }
    if w.get_channel_data("private.password").and_then(Value::as_str) != Some(password.as_str()) {
        return responder.fail("invalid password");
    }
    let display_name = w
        .get_channel_data("public.display_name")
        .cloned()
        .unwrap_or_else(|| json!(w.id().subid()));
    responder.ok(json!({ "display_name": display_name }));
}

fn cmd_rename(w: &mut Worker, args: &str) -> Result<String, String> {
    if args.is_empty() {
        return Err("Missing name".to_string());
    }
    write(w, "public.display_name", json!(args))?;
    Ok("Successfully renamed".to_string())
}
