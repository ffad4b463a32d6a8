use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{NetworkError, NodeRole, Result};

/// Application messages exchanged between fleet nodes after the transport
/// and envelope layers are peeled off. `replicate` and `version_info` are
/// internal to the storage fleet; everything else is the public surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Handshake {
        node_id: String,
        node_type: NodeRole,
    },
    Data {
        data: Value,
    },
    Heartbeat {
        node_id: String,
    },
    StoreData {
        processor_id: String,
        data: Value,
    },
    RetrieveData {
        query: Value,
    },
    Alert {
        data: Value,
    },
    Notify {
        data: Value,
    },
    Subscribe {
        subscriber_id: String,
    },
    Replicate {
        package: Value,
    },
    VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok {
            node_id: None,
            data_id: None,
            data: None,
            message: None,
        }
    }

    pub fn ok_with_node(node_id: impl Into<String>) -> Self {
        Response::Ok {
            node_id: Some(node_id.into()),
            data_id: None,
            data: None,
            message: None,
        }
    }

    pub fn ok_with_data_id(data_id: impl Into<String>) -> Self {
        Response::Ok {
            node_id: None,
            data_id: Some(data_id.into()),
            data: None,
            message: None,
        }
    }

    pub fn ok_with_data(data: Value) -> Self {
        Response::Ok {
            node_id: None,
            data_id: None,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

/// Decodes a decrypted plaintext into a typed request.
///
/// A missing `type` field or an unrecognized type is a protocol error; the
/// caller answers it with a structured error response instead of dropping
/// the message.
pub fn decode_request(plaintext: &Value) -> Result<Request> {
    let message_type = plaintext
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| NetworkError::Protocol("message has no type field".to_string()))?
        .to_string();

    serde_json::from_value(plaintext.clone()).map_err(|e| {
        NetworkError::Protocol(format!("invalid '{}' message: {}", message_type, e))
    })
}

pub fn decode_response(plaintext: &Value) -> Result<Response> {
    serde_json::from_value(plaintext.clone())
        .map_err(|e| NetworkError::Protocol(format!("invalid response: {}", e)))
}
