//! Stratum JSON-RPC frame decoding and encoding.
//!
//! One JSON object per line in each direction. Request ids may be a number,
//! a string or null, and responses echo them back untouched.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum accepted line length, newline included.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Error codes used in response error tuples.
pub mod codes {
    /// Catch-all: unknown method, malformed parameters.
    pub const OTHER: i64 = 20;
    pub const UNAUTHORIZED_WORKER: i64 = 24;
    pub const NOT_SUBSCRIBED: i64 = 25;
}

/// JSON-RPC request identifier.
///
/// Numbers keep their exact JSON representation, so `1` and `1.0` echo back
/// as written.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
    #[default]
    Null,
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id.into())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: RequestId,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: &str, params: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    /// String parameter at `index`; missing or non-string values read as "".
    pub fn str_param(&self, index: usize) -> &str {
        self.params
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Error tuple `[code, message, data]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError(pub i64, pub String, pub Value);

impl RpcError {
    pub fn new(code: i64, message: &str) -> Self {
        RpcError(code, message.to_string(), Value::Null)
    }

    pub fn unknown_method() -> Self {
        Self::new(codes::OTHER, "Unknown method")
    }

    pub fn invalid_submit_params() -> Self {
        Self::new(codes::OTHER, "Invalid submit parameters")
    }

    pub fn unauthorized_worker() -> Self {
        Self::new(codes::UNAUTHORIZED_WORKER, "Unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(codes::NOT_SUBSCRIBED, "Not subscribed")
    }

    pub fn code(&self) -> i64 {
        self.0
    }

    pub fn message(&self) -> &str {
        &self.1
    }
}

/// A response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// Error responses always carry a null result.
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// Why a line could not be turned into a request.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid request JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    TooLong,
}

/// Decode one line. Blank lines decode to `None`.
pub fn decode(line: &[u8]) -> Result<Option<Request>, DecodeError> {
    if line.len() > MAX_LINE_LENGTH {
        return Err(DecodeError::TooLong);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(line)?))
}

/// Append a response and its terminating newline to `out`.
pub fn encode(response: &Response, out: &mut BytesMut) -> Result<(), serde_json::Error> {
    serde_json::to_writer(out.writer(), response)?;
    out.put_u8(b'\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_str(response: &Response) -> String {
        let mut out = BytesMut::new();
        encode(response, &mut out).unwrap();
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_decode_request() {
        let req = decode(br#"{"id": 1, "method": "mining.subscribe", "params": ["miner/1.0"]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(req.id, RequestId::from(1));
        assert_eq!(req.method, "mining.subscribe");
        assert_eq!(req.params, vec![json!("miner/1.0")]);
    }

    #[test]
    fn test_decode_id_shapes() {
        let req = decode(br#"{"id": "abc", "method": "m", "params": []}"#)
            .unwrap()
            .unwrap();
        assert_eq!(req.id, RequestId::String("abc".into()));

        let req = decode(br#"{"id": null, "method": "m", "params": []}"#)
            .unwrap()
            .unwrap();
        assert_eq!(req.id, RequestId::Null);

        let req = decode(br#"{"method": "m"}"#).unwrap().unwrap();
        assert_eq!(req.id, RequestId::Null);
        assert!(req.params.is_empty());

        let req = decode(br#"{"id": 7, "method": "m", "params": null}"#)
            .unwrap()
            .unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(b"[1, 2, 3]"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(br#"{"id": 1}"#), Err(DecodeError::Json(_))));
        assert!(matches!(decode(b"\xff\xfe{}"), Err(DecodeError::Json(_))));
        let long = vec![b' '; MAX_LINE_LENGTH + 1];
        assert!(matches!(decode(&long), Err(DecodeError::TooLong)));
    }

    #[test]
    fn test_decode_blank_line() {
        assert!(decode(b"\r\n").unwrap().is_none());
        assert!(decode(b"").unwrap().is_none());
    }

    #[test]
    fn test_encode_result() {
        let line = encode_str(&Response::result(RequestId::from(3), json!(true)));
        assert_eq!(line, "{\"id\":3,\"result\":true,\"error\":null}\n");
    }

    #[test]
    fn test_encode_error_tuple() {
        let line = encode_str(&Response::error(RequestId::Null, RpcError::unknown_method()));
        assert_eq!(
            line,
            "{\"id\":null,\"result\":null,\"error\":[20,\"Unknown method\",null]}\n"
        );
    }

    #[test]
    fn test_id_echo_keeps_shape() {
        for raw in ["1", "1.5", "\"1\"", "null", "18446744073709551615"] {
            let line = format!(r#"{{"id": {raw}, "method": "m", "params": []}}"#);
            let req = decode(line.as_bytes()).unwrap().unwrap();
            let out = encode_str(&Response::result(req.id, Value::Null));
            let echoed: Value = serde_json::from_str(&out).unwrap();
            let original: Value = serde_json::from_str(raw).unwrap();
            assert_eq!(echoed["id"], original, "id {raw} changed shape");
        }
    }

    #[test]
    fn test_str_param() {
        let req = Request::new(1, "m", vec![json!("a"), json!(5)]);
        assert_eq!(req.str_param(0), "a");
        assert_eq!(req.str_param(1), "");
        assert_eq!(req.str_param(9), "");
    }
}
