use crate::ids::RoomId;

/// Failure taxonomy for the RPC framework.
///
/// Dispatch-layer failures are caught at the registry's invoke boundary and
/// turned into structured error frames; `Domain` values come from room
/// method bodies and pass through untouched. `DuplicateMethodName` is a
/// construction-time error that keeps the offending room type from ever
/// becoming available.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RpcError {
    #[error("could not find RPC method with name {method}")]
    UnknownMethod { method: String },

    #[error("unknown parameter name '{param}' in {method}, expected are [{expected}]")]
    UnknownParameter {
        method: String,
        param: String,
        expected: String,
    },

    #[error("required parameter '{param}' is not specified for method {method}")]
    MissingRequiredParameter { method: String, param: String },

    #[error("invalid value for parameter '{param}' of method {method}: {detail}")]
    InvalidParameter {
        method: String,
        param: String,
        detail: String,
    },

    #[error("unknown room type: {0}")]
    UnknownRoomType(String),

    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),

    #[error("duplicate RPC method name: {0}")]
    DuplicateMethodName(String),

    #[error("internal dispatch error: {0}")]
    Internal(String),

    /// Opaque failure produced by a room's own method body. The framework
    /// never inspects or rewrites the payload.
    #[error("domain failure: {0}")]
    Domain(serde_json::Value),
}

impl RpcError {
    /// Stable code string used in error frames on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownMethod { .. } => "UNKNOWN_METHOD",
            Self::UnknownParameter { .. } => "UNKNOWN_PARAMETER",
            Self::MissingRequiredParameter { .. } => "MISSING_REQUIRED_PARAMETER",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::UnknownRoomType(_) => "UNKNOWN_ROOM_TYPE",
            Self::UnknownRoom(_) => "UNKNOWN_ROOM",
            Self::DuplicateMethodName(_) => "DUPLICATE_METHOD_NAME",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Domain(_) => "DOMAIN_FAILURE",
        }
    }
}
