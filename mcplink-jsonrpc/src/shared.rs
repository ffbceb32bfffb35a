//! Wire-level JSON-RPC types shared by both ends of a connection.
//!
//! Every message that crosses a transport is an [`Envelope`]: a closed enum of the four shapes
//! JSON-RPC 2.0 allows.  Parsing is deliberately strict about the fields that decide which shape
//! a message has, because the router and the pending-request table both key off that decision.
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub use jsonrpsee_types::{ErrorCode, TwoPointZero};

/// Identifier of a request, chosen by whichever side sends the request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// Opaque value correlating progress notifications with the request that asked for them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressToken::Number(n) => write!(f, "{n}"),
            ProgressToken::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(value: &str) -> Self {
        ProgressToken::String(value.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(value: i64) -> Self {
        ProgressToken::Number(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// An error reply.  The id is `None` only when the offending message's id could not be read.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

/// The `error` member of an error reply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One JSON-RPC message, in any of the shapes the protocol allows.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(ErrorResponse),
}

impl Envelope {
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: impl Into<Option<Value>>,
    ) -> Self {
        Envelope::Request(Request {
            id: id.into(),
            method: method.into(),
            params: params.into(),
        })
    }

    pub fn notification(method: impl Into<String>, params: impl Into<Option<Value>>) -> Self {
        Envelope::Notification(Notification {
            method: method.into(),
            params: params.into(),
        })
    }

    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        Envelope::Response(Response {
            id: id.into(),
            result,
        })
    }

    pub fn error(id: impl Into<Option<RequestId>>, error: impl Into<ErrorObject>) -> Self {
        Envelope::Error(ErrorResponse {
            id: id.into(),
            error: error.into(),
        })
    }

    /// The id this message is correlated with, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => Some(&r.id),
            Envelope::Error(e) => e.id.as_ref(),
            Envelope::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) | Envelope::Error(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Envelope::Request(r) => r.params.as_ref(),
            Envelope::Notification(n) => n.params.as_ref(),
            Envelope::Response(_) | Envelope::Error(_) => None,
        }
    }

    /// True for responses and errors, which end the exchange for their id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Response(_) | Envelope::Error(_))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let mut object = match value {
            Value::Object(object) => object,
            Value::Array(_) => return Err(EnvelopeError::invalid(None, "batches are not supported")),
            _ => return Err(EnvelopeError::invalid(None, "message must be a JSON object")),
        };

        // Read the id first so that every later validation failure can still be reported
        // against it.
        let id = match object.remove("id") {
            None => IdField::Absent,
            Some(Value::Null) => IdField::Null,
            Some(value) => match serde_json::from_value::<RequestId>(value) {
                Ok(id) => IdField::Present(id),
                Err(_) => {
                    return Err(EnvelopeError::invalid(
                        None,
                        "id must be a string or an integer",
                    ))
                }
            },
        };
        let known_id = id.as_option();

        match object.remove("jsonrpc") {
            Some(Value::String(version)) if version == "2.0" => {}
            _ => return Err(EnvelopeError::invalid(known_id, "jsonrpc must be \"2.0\"")),
        }

        let method = take_method(&mut object, &known_id)?;
        let params = take_params(&mut object, &known_id)?;
        let result = object.remove("result");
        let error = object.remove("error");

        match (method, id) {
            (Some(_), _) if result.is_some() || error.is_some() => Err(EnvelopeError::invalid(
                known_id,
                "a request cannot carry result or error",
            )),
            (Some(method), IdField::Present(id)) => {
                Ok(Envelope::Request(Request { id, method, params }))
            }
            (Some(_), IdField::Null) => Err(EnvelopeError::invalid(None, "request id must not be null")),
            (Some(method), IdField::Absent) => {
                Ok(Envelope::Notification(Notification { method, params }))
            }
            (None, id) => match (result, error) {
                (Some(_), Some(_)) => Err(EnvelopeError::invalid(
                    known_id,
                    "result and error are mutually exclusive",
                )),
                (Some(result), None) => match id {
                    IdField::Present(id) => Ok(Envelope::Response(Response { id, result })),
                    _ => Err(EnvelopeError::invalid(None, "response id must not be null")),
                },
                (None, Some(error)) => {
                    let error = serde_json::from_value::<ErrorObject>(error).map_err(|_| {
                        EnvelopeError::invalid(known_id.clone(), "malformed error object")
                    })?;
                    Ok(Envelope::Error(ErrorResponse {
                        id: known_id,
                        error,
                    }))
                }
                (None, None) => Err(EnvelopeError::invalid(
                    known_id,
                    "message has neither method, result nor error",
                )),
            },
        }
    }
}

enum IdField {
    Absent,
    Null,
    Present(RequestId),
}

impl IdField {
    fn as_option(&self) -> Option<RequestId> {
        match self {
            IdField::Present(id) => Some(id.clone()),
            IdField::Absent | IdField::Null => None,
        }
    }
}

fn take_method(
    object: &mut Map<String, Value>,
    id: &Option<RequestId>,
) -> Result<Option<String>, EnvelopeError> {
    match object.remove("method") {
        None => Ok(None),
        Some(Value::String(method)) => Ok(Some(method)),
        Some(_) => Err(EnvelopeError::invalid(id.clone(), "method must be a string")),
    }
}

fn take_params(
    object: &mut Map<String, Value>,
    id: &Option<RequestId>,
) -> Result<Option<Value>, EnvelopeError> {
    match object.remove("params") {
        None | Some(Value::Null) => Ok(None),
        Some(params @ Value::Object(_)) => Ok(Some(params)),
        Some(_) => Err(EnvelopeError::invalid(id.clone(), "params must be an object")),
    }
}

impl FromStr for Envelope {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s)?;
        Envelope::from_value(value)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", &TwoPointZero)?;
        match self {
            Envelope::Request(Request { id, method, params }) => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("method", method)?;
                if let Some(params) = params {
                    map.serialize_entry("params", params)?;
                }
            }
            Envelope::Notification(Notification { method, params }) => {
                map.serialize_entry("method", method)?;
                if let Some(params) = params {
                    map.serialize_entry("params", params)?;
                }
            }
            Envelope::Response(Response { id, result }) => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("result", result)?;
            }
            Envelope::Error(ErrorResponse { id, error }) => {
                // A null id is still written out; JSON-RPC requires the member on errors.
                map.serialize_entry("id", id)?;
                map.serialize_entry("error", error)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Failure to turn some input into an [`Envelope`]
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Well-formed JSON that is not a valid JSON-RPC message.  Carries the id when one could be
    /// read, so the error reply can still be correlated.
    #[error("Invalid request: {reason}")]
    Invalid {
        id: Option<RequestId>,
        reason: String,
    },
}

impl EnvelopeError {
    fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        EnvelopeError::Invalid {
            id,
            reason: reason.into(),
        }
    }

    /// The error reply that should be sent back to whoever sent the malformed input
    pub fn to_error_envelope(&self) -> Envelope {
        match self {
            EnvelopeError::Parse(e) => Envelope::error(None, JsonRpcError::parse_error(e)),
            EnvelopeError::Invalid { id, reason } => {
                Envelope::error(id.clone(), JsonRpcError::invalid_request(reason.clone()))
            }
        }
    }
}

/// An error that will be reported to the remote side as a JSON-RPC error object.
///
/// Uses the error codes defined in the JSON-RPC spec, plus whatever application codes callers
/// pass to [`JsonRpcError::new`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    code: i32,
    message: String,
    data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>, data: impl Into<Option<Value>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    /// Make a new JSON RPC error, capturing the source error chain in the `data` field
    pub fn from_error(code: ErrorCode, error: &(dyn std::error::Error + 'static)) -> Self {
        let message = error.to_string();
        let mut inner = error.source();
        let mut chain = vec![];
        while let Some(e) = inner {
            chain.push(Value::String(e.to_string()));
            inner = e.source();
        }

        let data = if chain.is_empty() {
            None
        } else {
            Some(Value::Array(chain))
        };
        Self::new(code.code(), message, data)
    }

    /// Error deserializing some JSON.
    pub fn parse_error(error: &serde_json::Error) -> Self {
        Self::from_error(ErrorCode::ParseError, error)
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest.code(), reason, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound.code(),
            format!("Method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams.code(), reason, None)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError.code(), reason, None)
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }
}

impl From<JsonRpcError> for ErrorObject {
    fn from(error: JsonRpcError) -> Self {
        ErrorObject {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<ErrorObject> for JsonRpcError {
    fn from(error: ErrorObject) -> Self {
        JsonRpcError::new(error.code, error.message, error.data)
    }
}

/// Deserialize the expected parameters struct of a request, turning failures into an
/// invalid-params error suitable for returning directly to the caller.
///
/// Missing params are deserialized from an empty object, so parameter structs whose fields are
/// all optional work for requests that omit `params` entirely.
pub fn expect_params<P: serde::de::DeserializeOwned>(
    params: Option<&Value>,
) -> Result<P, JsonRpcError> {
    let params = params.cloned().unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(params).map_err(|e| {
        tracing::error!(error = %e, "Error deserializing params");
        JsonRpcError::invalid_params(format!("Invalid params: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_json_rpc_notification() {
        let request = r#"    { "jsonrpc": "2.0", "method": "notifications/initialized" }"#;
        let envelope: Envelope = request.parse().unwrap();
        assert_matches!(envelope, Envelope::Notification(Notification { method, params: None }) if method == "notifications/initialized");
    }

    #[test]
    fn parse_request_with_string_and_numeric_ids() {
        let envelope: Envelope = r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#.parse().unwrap();
        assert_eq!(envelope.id(), Some(&RequestId::from("abc")));

        let envelope: Envelope = r#"{"jsonrpc":"2.0","id":7,"method":"ping","params":{}}"#
            .parse()
            .unwrap();
        assert_eq!(envelope.id(), Some(&RequestId::Number(7)));
        assert_eq!(envelope.params(), Some(&json!({})));
    }

    #[test]
    fn error_with_null_id_is_accepted() {
        let envelope: Envelope =
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
                .parse()
                .unwrap();
        assert_matches!(envelope, Envelope::Error(ErrorResponse { id: None, error }) if error.code == -32700);
    }

    #[test]
    fn request_with_null_id_is_invalid() {
        let err = r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#
            .parse::<Envelope>()
            .unwrap_err();
        assert_matches!(err, EnvelopeError::Invalid { id: None, .. });
    }

    #[test]
    fn invalid_message_keeps_its_id() {
        let err = r#"{"jsonrpc":"1.0","id":3,"method":"ping"}"#
            .parse::<Envelope>()
            .unwrap_err();
        assert_matches!(&err, EnvelopeError::Invalid { id: Some(RequestId::Number(3)), .. });

        let reply = err.to_error_envelope();
        assert_eq!(reply.id(), Some(&RequestId::Number(3)));
        assert_matches!(reply, Envelope::Error(ErrorResponse { error, .. }) if error.code == ErrorCode::InvalidRequest.code());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = "{not json".parse::<Envelope>().unwrap_err();
        assert_matches!(err, EnvelopeError::Parse(_));
        assert_matches!(err.to_error_envelope(), Envelope::Error(ErrorResponse { id: None, error }) if error.code == ErrorCode::ParseError.code());
    }

    #[test]
    fn batches_and_ambiguous_messages_are_rejected() {
        assert_matches!(
            "[]".parse::<Envelope>(),
            Err(EnvelopeError::Invalid { .. })
        );
        assert_matches!(
            r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#
                .parse::<Envelope>(),
            Err(EnvelopeError::Invalid { id: Some(RequestId::Number(1)), .. })
        );
        assert_matches!(
            r#"{"jsonrpc":"2.0","id":1,"method":"x","params":[1,2]}"#.parse::<Envelope>(),
            Err(EnvelopeError::Invalid { .. })
        );
    }

    #[test]
    fn wire_format() {
        let envelopes = vec![
            Envelope::request(RequestId::Number(1), "tools/call", json!({"name": "echo"})),
            Envelope::notification("notifications/initialized", None),
            Envelope::response("req-1", json!({})),
            Envelope::error(None, JsonRpcError::method_not_found("nope")),
        ];
        let actual = serde_json::to_string_pretty(&envelopes).unwrap();
        expectorate::assert_contents("src/testdata/wire_format.json", &actual);

        let reparsed: Vec<Envelope> = serde_json::from_str(&actual).unwrap();
        assert_eq!(reparsed, envelopes);
    }

    #[test]
    fn error_chain_is_captured_in_data() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let error = Outer(std::io::Error::other("inner"));
        let rpc = JsonRpcError::from_error(ErrorCode::InternalError, &error);
        assert_eq!(rpc.message(), "outer");
        assert_eq!(rpc.data(), Some(&json!(["inner"])));
    }

    #[test]
    fn expect_params_reports_invalid_params() {
        #[derive(Debug, serde::Deserialize)]
        struct Params {
            #[allow(dead_code)]
            name: String,
        }

        let err = expect_params::<Params>(Some(&json!({"name": 5}))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParams.code());
    }
}
