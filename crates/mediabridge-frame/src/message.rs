use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{FrameError, Result};
use crate::kind::{kind_name, NOTIFICATION, REQUEST, RESPONSE};

/// A call issued by the host. `target_id` is absent for process-scoped calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Structured rejection carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Settlement of the request with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    /// Absent on the wire is `None`; an explicit `null` is `Some(Value::Null)`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Response {
    /// Successful response carrying `data`.
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Rejected response.
    pub fn error(id: u64, reason: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(RemoteError {
                reason: reason.into(),
                detail,
            }),
        }
    }

    /// Split into the success payload or the remote rejection.
    ///
    /// A successful response without `data` yields `Value::Null`; a failed
    /// response without `error` yields an `unspecified` reason.
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| RemoteError {
                reason: "unspecified".to_string(),
                detail: None,
            }))
        }
    }
}

/// Unsolicited event from the engine, scoped to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub target_id: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Every record that can travel over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Frame header kind for this message.
    pub fn kind(&self) -> u16 {
        match self {
            Message::Request(_) => REQUEST,
            Message::Response(_) => RESPONSE,
            Message::Notification(_) => NOTIFICATION,
        }
    }

    /// Serialize the JSON payload (header excluded).
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let encoded = match self {
            Message::Request(req) => serde_json::to_vec(req),
            Message::Response(resp) => serde_json::to_vec(resp),
            Message::Notification(notif) => serde_json::to_vec(notif),
        };
        encoded.map_err(|source| FrameError::Malformed {
            kind: kind_name(self.kind()),
            source,
        })
    }

    /// Parse a payload according to its header kind.
    pub fn from_payload(kind: u16, payload: &[u8]) -> Result<Self> {
        let malformed = |source| FrameError::Malformed {
            kind: kind_name(kind),
            source,
        };
        match kind {
            REQUEST => serde_json::from_slice(payload)
                .map(Message::Request)
                .map_err(malformed),
            RESPONSE => serde_json::from_slice(payload)
                .map(Message::Response)
                .map_err(malformed),
            NOTIFICATION => serde_json::from_slice(payload)
                .map(Message::Notification)
                .map_err(malformed),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}
