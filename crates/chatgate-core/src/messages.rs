//! Envelope and handshake message types.
//!
//! Every frame on the wire is a single JSON object `{"type": ..., "data": ...}`.
//! `data` is an opaque string; the authenticate reply carries a second JSON
//! document encoded inside it.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload of the challenge the server sends when a connection opens.
pub const CHALLENGE_PAYLOAD: &str = "123";

/// Payload of the administrative update broadcast.
pub const UPDATE_PAYLOAD: &str = "I am an update";

/// Envelope tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Authenticate,
    Authenticated,
    Chat,
    Update,
    Error,
    /// Any tag outside the known set. Only ever decoded, never sent.
    #[serde(other)]
    Unrecognized,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Authenticate => "authenticate",
            MsgType::Authenticated => "authenticated",
            MsgType::Chat => "chat",
            MsgType::Update => "update",
            MsgType::Error => "error",
            MsgType::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    pub fn new(msg_type: MsgType, data: impl Into<String>) -> Self {
        Self {
            msg_type,
            data: data.into(),
        }
    }

    /// The server's opening `authenticate` challenge.
    pub fn challenge(payload: impl Into<String>) -> Self {
        Self::new(MsgType::Authenticate, payload)
    }

    /// Reply to a successful handshake carrying the verified profile verbatim.
    pub fn authenticated(profile: impl Into<String>) -> Self {
        Self::new(MsgType::Authenticated, profile)
    }

    pub fn chat(data: impl Into<String>) -> Self {
        Self::new(MsgType::Chat, data)
    }

    /// The fixed administrative update.
    pub fn update() -> Self {
        Self::new(MsgType::Update, UPDATE_PAYLOAD)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(MsgType::Error, reason)
    }

    /// Copy of this envelope re-tagged as `chat`, keeping `data` untouched.
    pub fn as_chat(&self) -> Self {
        Self::chat(self.data.clone())
    }
}

/// Credentials carried (double-encoded) in the `data` of a client's
/// `authenticate` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationInput {
    pub bearer: String,
    pub user_uuid: String,
}

impl AuthenticationInput {
    /// Parse the JSON document embedded in an envelope's `data` field.
    ///
    /// Both fields must be present and non-empty, and the user id must be
    /// usable as a single URL path segment.
    pub fn parse(data: &str) -> GateResult<Self> {
        let input: Self = serde_json::from_str(data)
            .map_err(|e| GateError::Protocol(format!("malformed authentication input: {e}")))?;
        input.validate()?;
        Ok(input)
    }

    pub fn validate(&self) -> GateResult<()> {
        if self.bearer.is_empty() {
            return Err(GateError::Protocol("empty bearer token".into()));
        }
        if self.user_uuid.is_empty() {
            return Err(GateError::Protocol("empty user id".into()));
        }
        if self.user_uuid == "." || self.user_uuid == ".." {
            return Err(GateError::Protocol(format!(
                "invalid user id {:?}",
                self.user_uuid
            )));
        }
        Ok(())
    }
}
