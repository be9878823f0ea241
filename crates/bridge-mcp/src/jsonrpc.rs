use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request id.
///
/// The spec allows numbers, strings, and null. Anything else in the `id`
/// position is treated as null so a malformed caller id never breaks the
/// response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

impl JsonRpcId {
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number).unwrap_or(JsonRpcId::Null),
            Value::String(s) => JsonRpcId::String(s.clone()),
            _ => JsonRpcId::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: JsonRpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: JsonRpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Any single JSON-RPC 2.0 message.
///
/// Variant order matters for untagged deserialization: a request carries
/// both `id` and `method`, a notification only `method`, and a response is
/// matched last because both of its payload members are optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = JsonRpcRequest::new(
            JsonRpcId::Number(7),
            "tools/list",
            Some(serde_json::json!({})),
        );
        let s = serde_json::to_string(&req).expect("serialize");
        assert!(!s.contains('\n'), "framing requires single-line encoding");
        let got: JsonRpcRequest = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(got.id, JsonRpcId::Number(7));
        assert_eq!(got.method, "tools/list");
    }

    #[test]
    fn message_discriminates_request_notification_response() {
        let m: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).expect("request");
        assert!(matches!(m, JsonRpcMessage::Request(_)));

        let m: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .expect("notification");
        assert!(matches!(m, JsonRpcMessage::Notification(_)));

        let m: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).expect("response");
        assert!(matches!(m, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn string_and_null_ids_survive() {
        let resp = JsonRpcResponse::ok(
            JsonRpcId::String("abc".to_string()),
            serde_json::json!({"ok": true}),
        );
        let v = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(v["id"], "abc");

        let resp = JsonRpcResponse::err(
            JsonRpcId::Null,
            JsonRpcError {
                code: -32700,
                message: "parse error".to_string(),
                data: None,
            },
        );
        let v = serde_json::to_value(&resp).expect("serialize");
        assert!(v["id"].is_null());
        assert_eq!(v["error"]["code"], -32700);
    }

    #[test]
    fn id_from_value_maps_unsupported_shapes_to_null() {
        assert_eq!(
            JsonRpcId::from_value(&serde_json::json!(3)),
            JsonRpcId::Number(3)
        );
        assert_eq!(
            JsonRpcId::from_value(&serde_json::json!("x")),
            JsonRpcId::String("x".to_string())
        );
        assert_eq!(JsonRpcId::from_value(&serde_json::json!([1])), JsonRpcId::Null);
        assert_eq!(JsonRpcId::from_value(&serde_json::json!(1.5)), JsonRpcId::Null);
    }
}
