//! Wire shapes exchanged with the tracking service.
//!
//! Outbound messages are built as a [`Request`] (name plus fields) and only
//! receive their correlation id when the worker enqueues them. Inbound frames
//! are parsed into [`Inbound`] and classified with [`Inbound::response`].

use crate::config::JobCredentials;
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Field map of a message body.
pub type Fields = Map<String, Value>;

pub const AUTHENTICATE: &str = "authenticate";
pub const ACTION: &str = "action";
pub const REGISTER_CONTROLLER: &str = "peerController/register";
pub const UNREGISTER_CONTROLLER: &str = "peerController/unregister";
pub const PEER_MESSAGE: &str = "peerController/message";

/// An outbound message that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub name: String,
    pub fields: Fields,
}

impl Request {
    fn new(name: &str, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Fields::new(),
        };
        Self {
            name: name.to_string(),
            fields,
        }
    }

    /// `{name: "authenticate", token: {id: "job", token, job}}`
    pub fn authenticate_job(credentials: &JobCredentials) -> Self {
        Self::new(
            AUTHENTICATE,
            json!({
                "token": {
                    "id": "job",
                    "token": credentials.token,
                    "job": credentials.job_id,
                }
            }),
        )
    }

    /// `{name: "authenticate", token: {id: "user", token}}`
    pub fn authenticate_user(token: &str) -> Self {
        Self::new(AUTHENTICATE, json!({ "token": { "id": "user", "token": token } }))
    }

    /// `{name: "action", controller, action, args, timeout}`
    pub fn action(controller: &str, action: &str, args: Vec<Value>, timeout_secs: u64) -> Self {
        Self::new(
            ACTION,
            json!({
                "controller": controller,
                "action": action,
                "args": args,
                "timeout": timeout_secs,
            }),
        )
    }

    pub fn register_controller(name: &str) -> Self {
        Self::new(REGISTER_CONTROLLER, json!({ "controllerName": name }))
    }

    pub fn unregister_controller(name: &str) -> Self {
        Self::new(UNREGISTER_CONTROLLER, json!({ "controllerName": name }))
    }

    /// Reply to a peer request on behalf of controller `name`.
    pub fn peer_reply(name: &str, client_id: &Value, data: Value) -> Self {
        Self::new(
            PEER_MESSAGE,
            json!({
                "controllerName": name,
                "clientId": client_id,
                "data": data,
            }),
        )
    }

    /// Attach the correlation id.
    pub fn into_message(self, id: u64) -> OutboundMessage {
        OutboundMessage {
            id,
            name: self.name,
            fields: self.fields,
        }
    }
}

/// A message ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub id: u64,
    pub name: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A decoded inbound frame that carries a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub id: u64,
    pub body: Fields,
}

/// Classified meaning of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `{type: "next/json", next}`; `next` may be absent.
    Next(Option<Value>),
    /// `{type: "error", error}`
    Error(String),
    /// `{type: "ack"}`
    Ack,
    /// `{result}` answer to `authenticate`; only a literal `true` counts.
    Authenticated(bool),
    /// A request from the remote side for a registered controller.
    PeerMessage { client_id: Value, data: Value },
    /// Anything else, by its `type` tag.
    Unknown(String),
}

impl Inbound {
    /// Parse a frame. Frames without a numeric id yield `Ok(None)`.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ClientError::Protocol(format!("undecodable frame: {}", e)))?;
        let Value::Object(body) = value else {
            return Err(ClientError::Protocol("frame is not a JSON object".into()));
        };
        Ok(body
            .get("id")
            .and_then(Value::as_u64)
            .map(|id| Self { id, body }))
    }

    pub fn kind(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn response(&self) -> Response {
        match self.kind() {
            Some("next/json") => Response::Next(self.body.get("next").cloned()),
            Some("error") => Response::Error(error_text(self.body.get("error"))),
            Some("ack") => Response::Ack,
            Some(PEER_MESSAGE) => Response::PeerMessage {
                client_id: self.body.get("clientId").cloned().unwrap_or(Value::Null),
                data: self.body.get("data").cloned().unwrap_or(Value::Null),
            },
            Some(other) => Response::Unknown(other.to_string()),
            None => match self.body.get("result") {
                Some(result) => Response::Authenticated(result == &Value::Bool(true)),
                None => Response::Unknown(String::new()),
            },
        }
    }
}

fn error_text(error: Option<&Value>) -> String {
    match error {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown error".to_string(),
        Some(other) => other.to_string(),
    }
}

/// The two peer request kinds a controller answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequestKind {
    /// `actionTypes`: describe the parameters of one action.
    DescribeActions,
    /// `action`: call an action with positional arguments.
    Invoke,
    Other(String),
}

/// The `data` payload of an inbound peer message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PeerRequest {
    /// Remote-side id echoed back in the reply.
    #[serde(default)]
    pub id: Value,
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl PeerRequest {
    pub fn parse(data: Value) -> Result<Self> {
        serde_json::from_value(data)
            .map_err(|e| ClientError::Protocol(format!("malformed peer message: {}", e)))
    }

    pub fn kind(&self) -> PeerRequestKind {
        match self.name.as_str() {
            "actionTypes" => PeerRequestKind::DescribeActions,
            "action" => PeerRequestKind::Invoke,
            other => PeerRequestKind::Other(other.to_string()),
        }
    }
}

/// Reply payloads sent back inside `peerController/message`.
pub mod peer_reply {
    use serde_json::{json, Value};

    pub fn action_types(id: &Value, arity: usize) -> Value {
        let parameters: Vec<Value> = (0..arity)
            .map(|i| json!({ "type": "any", "name": format!("#{}", i) }))
            .collect();
        json!({
            "type": "actionTypes/result",
            "id": id,
            "parameters": parameters,
            "returnType": { "type": "any", "name": "result" },
        })
    }

    pub fn next(id: &Value, value: Value) -> Value {
        json!({
            "type": "next/json",
            "id": id,
            "encoding": { "name": "r", "type": "any" },
            "next": value,
        })
    }

    pub fn error(id: &Value, message: &str) -> Value {
        json!({
            "type": "error",
            "id": id,
            "stack": null,
            "entityName": "@error:default",
            "error": message,
        })
    }
}
