//! Channel data: a `public` tree that replicates to subscribers and a `private` tree
//! that never leaves the owning channel. Fields are addressed with dot paths such as
//! `public.clients.42.pos`; the first segment is parsed into a [`Scope`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DataPathError {
    #[error("failed: invalid scope")]
    InvalidScope,
    #[error("failed: missing member name")]
    MissingMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPath {
    scope: Scope,
    members: Vec<String>,
}

impl DataPath {
    pub fn public<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(Scope::Public, members)
    }

    pub fn private<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(Scope::Private, members)
    }

    fn build<I, S>(scope: Scope, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope,
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_public(&self) -> bool {
        self.scope == Scope::Public
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

impl FromStr for DataPath {
    type Err = DataPathError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let mut parts = key.split('.');
        let scope = match parts.next() {
            Some("public") => Scope::Public,
            Some("private") => Scope::Private,
            _ => return Err(DataPathError::InvalidScope),
        };
        let members: Vec<String> = parts.map(str::to_string).collect();
        if members.is_empty() || members.iter().any(String::is_empty) {
            return Err(DataPathError::MissingMember);
        }
        Ok(Self { scope, members })
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            Scope::Public => "public",
            Scope::Private => "private",
        };
        write!(f, "{scope}.{}", self.members.join("."))
    }
}

/// The persisted form of a channel's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default = "empty_object")]
    pub public: Value,
    #[serde(default = "empty_object")]
    pub private: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ChannelData {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            public: empty_object(),
            private: empty_object(),
        }
    }

    /// Rebuilds data from a store record, forcing both scopes to be objects.
    pub fn from_stored(channel_id: &str, stored: Option<Value>) -> Self {
        let mut data = stored
            .and_then(|v| serde_json::from_value::<ChannelData>(v).ok())
            .unwrap_or_else(|| ChannelData::new(channel_id));
        data.channel_id = channel_id.to_string();
        if !data.public.is_object() {
            data.public = empty_object();
        }
        if !data.private.is_object() {
            data.private = empty_object();
        }
        data
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "channel_id": self.channel_id,
            "public": self.public,
            "private": self.private,
        })
    }

    fn root(&self, scope: Scope) -> &Value {
        match scope {
            Scope::Public => &self.public,
            Scope::Private => &self.private,
        }
    }

    fn root_mut(&mut self, scope: Scope) -> &mut Value {
        match scope {
            Scope::Public => &mut self.public,
            Scope::Private => &mut self.private,
        }
    }

    pub fn get(&self, path: &DataPath) -> Option<&Value> {
        get_path(self.root(path.scope), &path.members)
    }

    /// Writes `value` at `path`, or deletes the member when `value` is `None`.
    pub fn set(&mut self, path: &DataPath, value: Option<Value>) {
        let root = self.root_mut(path.scope);
        match value {
            Some(value) => set_path(root, &path.members, value),
            None => delete_path(root, &path.members),
        }
    }

    pub fn delete(&mut self, path: &DataPath) {
        self.set(path, None);
    }
}

/// Looks up `members` inside `root`. Arrays are indexed by numeric segments.
pub fn get_path<'a>(root: &'a Value, members: &[String]) -> Option<&'a Value> {
    members.iter().try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes `value` at `members`, creating objects for missing or non-container parents.
pub fn set_path(root: &mut Value, members: &[String], value: Value) {
    let Some((last, parents)) = members.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for key in parents {
        node = child_mut(node, key);
    }
    if let Value::Array(items) = node {
        if let Some(i) = last.parse::<usize>().ok().filter(|i| *i <= items.len()) {
            if i < items.len() {
                items[i] = value;
            } else {
                items.push(value);
            }
            return;
        }
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

fn child_mut<'a>(node: &'a mut Value, key: &str) -> &'a mut Value {
    let index = match &*node {
        Value::Array(items) => key.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    };
    if index.is_none() && !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let child = match (node, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (Value::Object(map), _) => map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new())),
        (other, _) => other,
    };
    if !child.is_object() && !child.is_array() {
        *child = Value::Object(Map::new());
    }
    child
}

pub fn delete_path(root: &mut Value, members: &[String]) {
    let Some((last, parents)) = members.split_last() else {
        return;
    };
    let mut node = root;
    for key in parents {
        node = match node {
            Value::Object(map) => match map.get_mut(key) {
                Some(child) => child,
                None => return,
            },
            Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(child) => child,
                None => return,
            },
            _ => return,
        };
    }
    match node {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(items) => {
            if let Some(i) = last.parse::<usize>().ok().filter(|i| *i < items.len()) {
                items.remove(i);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(key: &str) -> DataPath {
        key.parse().unwrap()
    }

    #[test]
    fn parses_scope_and_members() {
        let p = path("public.clients.7.pos");
        assert!(p.is_public());
        assert_eq!(p.members(), ["clients", "7", "pos"]);
        assert_eq!(p.to_string(), "public.clients.7.pos");
        assert_eq!(path("private.secret").scope(), Scope::Private);
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!("nope.x".parse::<DataPath>(), Err(DataPathError::InvalidScope));
        assert_eq!("".parse::<DataPath>(), Err(DataPathError::InvalidScope));
        assert_eq!("public".parse::<DataPath>(), Err(DataPathError::MissingMember));
        assert_eq!("public.".parse::<DataPath>(), Err(DataPathError::MissingMember));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut data = ChannelData::new("room.1");
        data.set(&path("public.clients.7.pos"), Some(json!([1, 2])));
        assert_eq!(data.public, json!({ "clients": { "7": { "pos": [1, 2] } } }));
        assert_eq!(data.get(&path("public.clients.7.pos")), Some(&json!([1, 2])));
        assert_eq!(data.get(&path("public.clients.7.pos.1")), Some(&json!(2)));
    }

    #[test]
    fn set_overwrites_scalar_parents() {
        let mut data = ChannelData::new("room.1");
        data.set(&path("public.a"), Some(json!(5)));
        data.set(&path("public.a.b"), Some(json!(true)));
        assert_eq!(data.public, json!({ "a": { "b": true } }));
    }

    #[test]
    fn none_deletes_member() {
        let mut data = ChannelData::new("room.1");
        data.set(&path("private.secret"), Some(json!("s")));
        data.set(&path("private.keep"), Some(json!(1)));
        data.set(&path("private.secret"), None);
        assert_eq!(data.private, json!({ "keep": 1 }));
        data.delete(&path("private.missing.deep"));
        assert_eq!(data.private, json!({ "keep": 1 }));
    }

    #[test]
    fn from_stored_repairs_shape() {
        let data = ChannelData::from_stored("user.bob", Some(json!({ "public": 3 })));
        assert_eq!(data.channel_id, "user.bob");
        assert_eq!(data.public, json!({}));
        assert_eq!(data.private, json!({}));
        let fresh = ChannelData::from_stored("user.bob", None);
        assert_eq!(fresh.to_value()["channel_id"], json!("user.bob"));
    }
}
