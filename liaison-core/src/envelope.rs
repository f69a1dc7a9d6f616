//! Tagged JSON envelope codec.
//!
//! Every protocol frame that carries control information is a UTF-8 JSON
//! object with a mandatory integer `type` key. Binary payloads never travel
//! inside the envelope: they follow as separate frames.
//!
//! ```text
//! {"type":21,"applicationName":"app","applicationId":3,...}   REQUEST
//! {"type":22}                                                 RESPONSE
//! {"value":0,"message":"OK"}                                   acknowledgement
//! ```

use crate::endpoint::Endpoint;
use crate::identity::AppIdentity;
use crate::state::ApplicationState;
use bytes::Bytes;
use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Key of the type code in every envelope.
pub const TYPE: &str = "type";

/// Field names of the REQUEST envelope.
pub mod fields {
    pub const APPLICATION_NAME: &str = "applicationName";
    pub const APPLICATION_ID: &str = "applicationId";
    pub const SERVER_ENDPOINT: &str = "serverEndpoint";
    pub const SERVER_PROXY_PORT: &str = "serverProxyPort";
}

/// Serializes parse calls; the codec is shared by every protocol object of
/// the process, whatever thread they run on.
static PARSE_LOCK: Mutex<()> = const_mutex(());

fn parse_json(data: &[u8]) -> Result<Value, EnvelopeError> {
    let _guard = PARSE_LOCK.lock();
    serde_json::from_slice(data).map_err(|e| EnvelopeError::NotJson(e.to_string()))
}

/// Closed set of envelope type codes.
///
/// The numeric values are part of the wire format and must stay identical
/// across implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum MessageType {
    /// Readiness probe
    Sync = 1,
    /// Liveness broadcast emitted by a publisher during the rendezvous
    SyncStream = 2,
    /// Application lifecycle event from the supervisor
    Status = 13,
    PublisherProxyPort = 17,
    SubscriberProxyPort = 18,
    /// Cooperative cancellation signal
    Cancel = 19,
    /// RPC call
    Request = 21,
    /// RPC reply
    Response = 22,
    StoreKeyValue = 26,
    GetKeyValue = 27,
    RemoveKey = 28,
    RequestPort = 29,
    PortUnavailable = 30,
    ReleasePort = 31,
    Ports = 32,
    /// Broadcast data
    Stream = 34,
    /// Graceful end of a broadcast stream
    StreamEnd = 35,
    ResponderProxyPort = 36,
    /// Subscriber registration at a publisher rendezvous
    Subscribe = 100,
}

impl MessageType {
    pub const fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let kind = match code {
            1 => Self::Sync,
            2 => Self::SyncStream,
            13 => Self::Status,
            17 => Self::PublisherProxyPort,
            18 => Self::SubscriberProxyPort,
            19 => Self::Cancel,
            21 => Self::Request,
            22 => Self::Response,
            26 => Self::StoreKeyValue,
            27 => Self::GetKeyValue,
            28 => Self::RemoveKey,
            29 => Self::RequestPort,
            30 => Self::PortUnavailable,
            31 => Self::ReleasePort,
            32 => Self::Ports,
            34 => Self::Stream,
            35 => Self::StreamEnd,
            36 => Self::ResponderProxyPort,
            100 => Self::Subscribe,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::SyncStream => "SYNC_STREAM",
            Self::Status => "STATUS",
            Self::PublisherProxyPort => "PUBLISHER_PROXY_PORT",
            Self::SubscriberProxyPort => "SUBSCRIBER_PROXY_PORT",
            Self::Cancel => "CANCEL",
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::StoreKeyValue => "STORE_KEY_VALUE",
            Self::GetKeyValue => "GET_KEY_VALUE",
            Self::RemoveKey => "REMOVE_KEY",
            Self::RequestPort => "REQUEST_PORT",
            Self::PortUnavailable => "PORT_UNAVAILABLE",
            Self::ReleasePort => "RELEASE_PORT",
            Self::Ports => "PORTS",
            Self::Stream => "STREAM",
            Self::StreamEnd => "STREAM_END",
            Self::ResponderProxyPort => "RESPONDER_PROXY_PORT",
            Self::Subscribe => "SUBSCRIBE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded envelope: type code plus the remaining typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: MessageType,
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            fields: Map::new(),
        }
    }

    /// Add a field. The `type` key is reserved and ignored here.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != TYPE {
            self.fields.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str, EnvelopeError> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| EnvelopeError::InvalidField(key.to_string()))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, EnvelopeError> {
        self.fields
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| EnvelopeError::InvalidField(key.to_string()))
    }

    pub fn get_i32(&self, key: &str) -> Result<i32, EnvelopeError> {
        i32::try_from(self.get_i64(key)?).map_err(|_| EnvelopeError::InvalidField(key.to_string()))
    }

    /// Serialize to UTF-8 JSON text.
    pub fn encode(&self) -> Bytes {
        let mut object = self.fields.clone();
        object.insert(TYPE.to_string(), Value::from(self.kind.code()));
        Bytes::from(Value::Object(object).to_string())
    }

    /// Parse a UTF-8 JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] when the payload is not a JSON object, has no
    /// integer `type`, or carries a code outside [`MessageType`].
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let Value::Object(mut fields) = parse_json(data)? else {
            return Err(EnvelopeError::NotAnObject);
        };
        let code = fields.remove(TYPE).ok_or(EnvelopeError::MissingType)?;
        let code = code.as_i64().ok_or(EnvelopeError::InvalidType)?;
        let kind = MessageType::from_code(code).ok_or(EnvelopeError::UnknownType(code))?;
        Ok(Self { kind, fields })
    }

    pub fn sync() -> Self {
        Self::new(MessageType::Sync)
    }

    pub fn cancel() -> Self {
        Self::new(MessageType::Cancel)
    }

    pub fn response() -> Self {
        Self::new(MessageType::Response)
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    /// REQUEST envelope carrying the caller's identity so the peer can call back.
    pub fn request(app: &AppIdentity) -> Self {
        Self::new(MessageType::Request)
            .with(fields::APPLICATION_NAME, app.name.as_str())
            .with(fields::APPLICATION_ID, app.id)
            .with(fields::SERVER_ENDPOINT, app.endpoint.to_string())
            .with(fields::SERVER_PROXY_PORT, app.proxy_port)
    }
}

/// Caller identity decoded from a REQUEST envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterInfo {
    pub name: String,
    pub id: i32,
    pub server_endpoint: Endpoint,
    pub proxy_port: u16,
}

impl RequesterInfo {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, EnvelopeError> {
        let endpoint = envelope.get_str(fields::SERVER_ENDPOINT)?;
        let server_endpoint = Endpoint::parse(endpoint)
            .map_err(|_| EnvelopeError::InvalidField(fields::SERVER_ENDPOINT.to_string()))?;
        let proxy_port = u16::try_from(envelope.get_i64(fields::SERVER_PROXY_PORT)?)
            .map_err(|_| EnvelopeError::InvalidField(fields::SERVER_PROXY_PORT.to_string()))?;
        Ok(Self {
            name: envelope.get_str(fields::APPLICATION_NAME)?.to_string(),
            id: envelope.get_i32(fields::APPLICATION_ID)?,
            server_endpoint,
            proxy_port,
        })
    }
}

/// Generic acknowledgement: `value` 0 is OK, -1 is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub value: i32,
    pub message: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            value: 0,
            message: "OK".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            value: -1,
            message: message.into(),
        }
    }

    pub fn unknown_request() -> Self {
        Self::error("Unknown request")
    }

    pub fn is_ok(&self) -> bool {
        self.value == 0
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(
            serde_json::json!({ "value": self.value, "message": self.message }).to_string(),
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_value(parse_json(data)?)
            .map_err(|e| EnvelopeError::NotJson(e.to_string()))
    }
}

/// Lifecycle event published by the supervisor on the status topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub application_state: i32,
    #[serde(default)]
    pub past_application_states: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StatusEvent {
    pub fn new(id: i32, state: ApplicationState) -> Self {
        Self {
            id,
            name: None,
            application_state: state.code(),
            past_application_states: 0,
            exit_code: None,
        }
    }

    pub fn state(&self) -> ApplicationState {
        ApplicationState::from_code(self.application_state)
    }

    pub fn encode(&self) -> Bytes {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::from(self.id));
        if let Some(name) = &self.name {
            object.insert("name".to_string(), Value::from(name.as_str()));
        }
        object.insert(
            "applicationState".to_string(),
            Value::from(self.application_state),
        );
        object.insert(
            "pastApplicationStates".to_string(),
            Value::from(self.past_application_states),
        );
        if let Some(code) = self.exit_code {
            object.insert("exitCode".to_string(), Value::from(code));
        }
        Bytes::from(Value::Object(object).to_string())
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_value(parse_json(data)?)
            .map_err(|e| EnvelopeError::NotJson(e.to_string()))
    }
}

/// Errors raised by the envelope codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    NotJson(String),

    #[error("Malformed envelope: not a JSON object")]
    NotAnObject,

    #[error("Malformed envelope: missing `type` field")]
    MissingType,

    #[error("Malformed envelope: `type` is not an integer")]
    InvalidType,

    #[error("Unknown envelope type {0}")]
    UnknownType(i64),

    #[error("Missing or invalid envelope field `{0}`")]
    InvalidField(String),
}
