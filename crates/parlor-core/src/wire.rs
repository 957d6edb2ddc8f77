use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::ids::RoomId;

/// Reserved method name that binds the sending connection to a room.
/// Its params carry a [`BindRequest`] instead of regular call parameters.
pub const BIND_METHOD: &str = "-bindToRoom";

/// Inbound RPC envelope, one per WebSocket text frame.
///
/// There is no correlation id: results are pushed back to the bound
/// connections, so request/response coupling lives at the application layer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub method_name: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// Params shape of the [`BIND_METHOD`] control message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub bind_params: Option<serde_json::Value>,
}

/// Tagged outbound error frame; clients discriminate on `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn parse_error() -> Self {
        Self::new("PARSE_ERROR", "could not parse RPC envelope")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("INVALID_REQUEST", message)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({"type": "error", "code": self.code, "message": self.message})
        })
    }
}

impl From<&RpcError> for ErrorFrame {
    fn from(err: &RpcError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
