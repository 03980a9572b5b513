use serde::{Deserialize, Serialize};

use plantsim_runtime::LifecycleError;

/// JSON-RPC request as sent over the WebSocket.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Control responses carry `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, "METHOD_NOT_FOUND", format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, "INVALID_PARAMS", msg)
    }

    pub fn internal_error(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, "INTERNAL_ERROR", msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, "PARSE_ERROR", "Parse error")
    }

    /// Map a lifecycle failure onto a stable wire code. Ownership mismatch
    /// and absence share NOT_FOUND on purpose.
    pub fn from_lifecycle_error(id: Option<serde_json::Value>, error: &LifecycleError) -> Self {
        let code = match error {
            LifecycleError::InvalidTransition { .. } => "INVALID_STATE",
            LifecycleError::CapExceeded { .. } => "CAP_EXCEEDED",
            LifecycleError::NotFound => "NOT_FOUND",
            LifecycleError::NotRecoverable => "NOT_RECOVERABLE",
            LifecycleError::RecoveryFailed(_) => "RECOVERY_FAILED",
            LifecycleError::InitFailed(_) => "INIT_FAILED",
            LifecycleError::WorkerExists
            | LifecycleError::WorkerUnavailable
            | LifecycleError::Store(_) => "INTERNAL_ERROR",
        };
        Self::error(id, code, error.to_string())
    }
}

/// Extract a required string param from the RPC params object.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

/// Extract an optional string param.
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Extract an optional u32 param.
pub fn optional_u32(params: &serde_json::Value, key: &str) -> Option<u32> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v.min(u64::from(u32::MAX)) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantsim_runtime::CapScope;

    #[test]
    fn parse_rpc_request() {
        let json = r#"{"method":"session.start","params":{"session_id":"sess_123","user_id":"user_9"},"id":1}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "session.start");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn success_response_shape() {
        let resp = RpcResponse::success(Some(serde_json::json!(7)), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::method_not_found(None, "session.fork");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("METHOD_NOT_FOUND"));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn lifecycle_error_codes() {
        let cases: Vec<(LifecycleError, &str)> = vec![
            (
                LifecycleError::InvalidTransition {
                    from: plantsim_store::sessions::SessionStatus::Idle,
                    action: "pause",
                },
                "INVALID_STATE",
            ),
            (LifecycleError::CapExceeded { scope: CapScope::PerUser }, "CAP_EXCEEDED"),
            (LifecycleError::NotFound, "NOT_FOUND"),
            (LifecycleError::NotRecoverable, "NOT_RECOVERABLE"),
            (LifecycleError::InitFailed("x".into()), "INIT_FAILED"),
            (LifecycleError::WorkerUnavailable, "INTERNAL_ERROR"),
        ];
        for (error, code) in cases {
            let resp = RpcResponse::from_lifecycle_error(None, &error);
            assert_eq!(resp.error.unwrap().code, code);
        }
    }

    #[test]
    fn param_extractors() {
        let params = serde_json::json!({"session_id": "sess_1", "limit": 50});
        assert_eq!(require_str(&params, "session_id").unwrap(), "sess_1");
        assert!(require_str(&params, "user_id").is_err());
        assert_eq!(optional_str(&params, "missing"), None);
        assert_eq!(optional_u32(&params, "limit"), Some(50));
        assert_eq!(optional_u32(&params, "session_id"), None);
    }
}
