//! # Fabric Errors
//!
//! Common error types used by the exchange, the channel runtime and the client mirror.
//!
//! Routing failures travel over the wire as short string codes (`ERR_NOT_FOUND`, ...),
//! so every [`FabricError`] can be turned into its wire code with [`FabricError::code`]
//! and recovered on the other side with [`FabricError::from_wire`]. Application errors
//! that are plain strings (`"invalid password"`) survive the round trip as
//! [`FabricError::Remote`].

pub const ERR_NOT_FOUND: &str = "ERR_NOT_FOUND";
pub const ERR_UNKNOWN_CHANNEL_TYPE: &str = "ERR_UNKNOWN_CHANNEL_TYPE";
pub const ERR_INVALID_CHANNEL_ID: &str = "ERR_INVALID_CHANNEL_ID";
pub const ERR_RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
pub const ERR_DISCONNECTED: &str = "ERR_DISCONNECTED";
pub const ERR_ALREADY_REGISTERED: &str = "ERR_ALREADY_REGISTERED";
pub const ERR_NOT_LOGGED_IN: &str = "ERR_NOT_LOGGED_IN";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_ACCESS_DENIED: &str = "ERR_ACCESS_DENIED";
pub const ERR_NOT_SUBSCRIBED: &str = "ERR_NOT_SUBSCRIBED";
pub const ERR_SETIF_MISMATCH: &str = "ERR_SETIF_MISMATCH";
pub const ERR_NOT_ARRAY: &str = "ERR_NOT_ARRAY";

/// Errors that can occur within the fabric itself.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("ERR_NOT_FOUND")]
    NotFound,
    #[error("ERR_UNKNOWN_CHANNEL_TYPE")]
    UnknownChannelType,
    #[error("ERR_INVALID_CHANNEL_ID")]
    InvalidChannelId,
    #[error("RETRIES_EXHAUSTED")]
    RetriesExhausted,
    #[error("ERR_DISCONNECTED")]
    Disconnected,
    #[error("ERR_ALREADY_REGISTERED")]
    AlreadyRegistered,
    #[error("ERR_NOT_LOGGED_IN")]
    NotLoggedIn,
    #[error("ERR_TIMEOUT")]
    Timeout,
    #[error("Channel type already registered: {0}")]
    DuplicateChannelType(String),
    #[error("Handler name collision on {channel_type}: {name}")]
    DuplicateHandler { channel_type: String, name: String },
    #[error("Actor closed")]
    ActorClosed,
    #[error("Actor dropped response channel")]
    ActorDropped,
    #[error("{0}")]
    Remote(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FabricError {
    /// The string carried in the `err` field of a response envelope.
    pub fn code(&self) -> String {
        self.to_string()
    }

    /// Maps a wire error string back to a typed error where one exists.
    pub fn from_wire(err: impl Into<String>) -> Self {
        let err = err.into();
        match err.as_str() {
            ERR_NOT_FOUND => FabricError::NotFound,
            ERR_UNKNOWN_CHANNEL_TYPE => FabricError::UnknownChannelType,
            ERR_INVALID_CHANNEL_ID => FabricError::InvalidChannelId,
            ERR_RETRIES_EXHAUSTED => FabricError::RetriesExhausted,
            ERR_DISCONNECTED => FabricError::Disconnected,
            ERR_ALREADY_REGISTERED => FabricError::AlreadyRegistered,
            ERR_NOT_LOGGED_IN => FabricError::NotLoggedIn,
            ERR_TIMEOUT => FabricError::Timeout,
            _ => FabricError::Remote(err),
        }
    }

    /// True for routing failures that a caller cannot fix by retrying.
    pub fn is_terminal_routing(&self) -> bool {
        matches!(
            self,
            FabricError::UnknownChannelType | FabricError::InvalidChannelId
        )
    }
}

impl From<String> for FabricError {
    fn from(err: String) -> Self {
        FabricError::from_wire(err)
    }
}
