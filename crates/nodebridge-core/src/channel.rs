//! Channel codec for messages exchanged with the embedded runtime.
//!
//! Each channel message is a JSON object `{"eventName": .., "eventMessage": ..}`
//! where `eventMessage` itself holds a JSON array serialized to a string. Both
//! layers are decoded here so the rest of the crate only sees
//! [`DecodedMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const APP_CHANNEL: &str = "APP_CHANNEL";
pub const EVENT_CHANNEL: &str = "EVENT_CHANNEL";

pub const READY_EVENT: &str = "ready";
pub const RESUME_EVENT: &str = "resume";
pub const PAUSE_EVENT: &str = "pause";

const EMPTY_ARGS: &str = "[]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelName {
    /// Lifecycle and control events (`ready`, `resume`, `pause`).
    App,
    /// User-level application events.
    Event,
}

impl ChannelName {
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::App => APP_CHANNEL,
            Self::Event => EVENT_CHANNEL,
        }
    }

    /// Unknown names map to `None` and are ignored by callers.
    pub fn from_wire(input: &str) -> Option<Self> {
        match input {
            APP_CHANNEL => Some(Self::App),
            EVENT_CHANNEL => Some(Self::Event),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    event_name: String,
    event_message: String,
}

/// An encoded message ready to be written to the runtime on `channel`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEnvelope {
    pub channel: ChannelName,
    pub payload: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedMessage {
    pub channel: String,
    pub event_name: String,
    pub args: Vec<Value>,
}

impl DecodedMessage {
    pub fn is_ready_signal(&self) -> bool {
        self.channel == APP_CHANNEL && self.event_name == READY_EVENT
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("invalid channel message: {0}")]
    InvalidJson(String),
    #[error("channel message is not an object")]
    NotAnObject,
    #[error("channel message has no eventName")]
    MissingEventName,
}

pub fn encode_args(args: &[Value]) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| EMPTY_ARGS.to_string())
}

pub fn encode(channel: ChannelName, event_name: &str, args: &[Value]) -> ChannelEnvelope {
    let wire = WireMessage {
        event_name: event_name.to_string(),
        event_message: encode_args(args),
    };
    let payload = serde_json::to_string(&wire).unwrap_or_else(|_| {
        serde_json::json!({ "eventName": event_name, "eventMessage": EMPTY_ARGS }).to_string()
    });
    ChannelEnvelope { channel, payload }
}

pub fn decode(channel: &str, raw: &str) -> Result<DecodedMessage, DecodeFailure> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeFailure::InvalidJson(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeFailure::NotAnObject);
    };

    let event_name = match object.remove("eventName") {
        Some(Value::String(name)) => name,
        _ => return Err(DecodeFailure::MissingEventName),
    };

    let args = match object.remove("eventMessage") {
        Some(Value::String(message)) => decode_args(&message),
        _ => Vec::new(),
    };

    Ok(DecodedMessage {
        channel: channel.to_string(),
        event_name,
        args,
    })
}

fn decode_args(message: &str) -> Vec<Value> {
    if message.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(message) {
        Ok(Value::Array(args)) => args,
        _ => Vec::new(),
    }
}
