//! Channel identity and sender metadata.

use crate::error::FabricError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CLIENT_TYPE: &str = "client";
pub const USER_TYPE: &str = "user";

/// `type.subid`, split at the first `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    full: String,
    dot: usize,
}

impl ChannelId {
    pub fn parse(id: &str) -> Result<Self, FabricError> {
        match id.find('.') {
            Some(dot) if dot > 0 && dot + 1 < id.len() => Ok(Self {
                full: id.to_string(),
                dot,
            }),
            _ => Err(FabricError::InvalidChannelId),
        }
    }

    pub fn new(channel_type: &str, subid: &str) -> Result<Self, FabricError> {
        Self::parse(&format!("{channel_type}.{subid}"))
    }

    pub fn channel_type(&self) -> &str {
        &self.full[..self.dot]
    }

    pub fn subid(&self) -> &str {
        &self.full[self.dot + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// Store record key: `type/type.subid`.
    pub fn store_key(&self) -> String {
        format!("{}/{}", self.channel_type(), self.full)
    }

    pub fn is_client(&self) -> bool {
        self.channel_type() == CLIENT_TYPE
    }
}

impl FromStr for ChannelId {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Identity attached to every packet a channel sends. Client channels fill these in
/// after login so receivers can authorize without a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Who sent the message being handled.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub channel_id: ChannelId,
    pub ids: SenderIds,
}

impl Source {
    pub fn is_client(&self) -> bool {
        self.channel_id.is_client()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.ids.user_id.as_deref()
    }
}
