//! Payload envelopes for the CloudPlugs MQTT protocol
//!
//! Requests are JSON objects built by the client; replies are validated here
//! before a pending request is resolved, so a malformed reply turns into a
//! `ClientError::Protocol` instead of a half-filled success value.

use crate::correlator::RequestKind;
use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the correlation id field in property requests and replies
pub const CORRELATION_FIELD: &str = "cid";

/// Data record published on `{plug}/data/{topic}`
///
/// `ttl` is written whenever it is set, even if `data` carries its own
/// `expire_at`. The platform ignores `ttl` in that case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataRecord {
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

impl DataRecord {
    /// Wrap an application message; JSON text is embedded as JSON, anything else as a string
    pub fn from_message(message: &str, ttl: Option<u32>) -> Self {
        let data = serde_json::from_str::<Value>(message)
            .unwrap_or_else(|_| Value::String(message.to_string()));
        Self { data, ttl }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(self).map_err(ClientError::Serialization)
    }
}

/// Property get/set request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyRequest {
    pub cid: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Property reply, shared by get and set
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PropertyReply {
    pub cid: String,
    pub key: Option<String>,
    pub value: Option<Value>,
    pub error: Option<RemoteFault>,
}

/// Enrollment request; `ctrl` is set for controller enrollment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollRequest {
    pub hwid: String,
    pub model: String,
    pub pass: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<String>,
}

/// Enrollment reply
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EnrollReply {
    pub id: Option<String>,
    pub auth: Option<String>,
    pub error: Option<RemoteFault>,
}

/// Failure reported by the platform inside a reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFault {
    pub code: Option<i64>,
    pub message: String,
}

impl From<RemoteFault> for ClientError {
    fn from(fault: RemoteFault) -> Self {
        ClientError::Rejected {
            code: fault.code,
            message: fault.message,
        }
    }
}

/// Plug id and auth token issued by a successful enrollment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollCredentials {
    pub plug_id: String,
    pub auth: String,
}

/// Decoded outcome of a correlated request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Property value returned by a get
    Value(Value),
    /// Set acknowledged
    Ack,
    /// Enrollment accepted
    Enrolled(EnrollCredentials),
}

impl PropertyRequest {
    pub fn get(cid: &str, key: &str) -> Self {
        Self {
            cid: cid.to_string(),
            key: key.to_string(),
            value: None,
        }
    }

    pub fn set(cid: &str, key: &str, value: Value) -> Self {
        Self {
            cid: cid.to_string(),
            key: key.to_string(),
            value: Some(value),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(self).map_err(ClientError::Serialization)
    }
}

impl EnrollRequest {
    pub fn to_payload(&self) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(self).map_err(ClientError::Serialization)
    }
}

/// Extract the correlation id from a property reply without validating the rest
pub fn correlation_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value
        .get(CORRELATION_FIELD)?
        .as_str()
        .filter(|cid| !cid.is_empty())
        .map(str::to_string)
}

/// Decode a reply payload for the given request kind
pub fn decode_reply(kind: RequestKind, payload: &[u8]) -> Result<Reply, ClientError> {
    match kind {
        RequestKind::GetProperty => {
            let reply = parse_property_reply(payload)?;
            if let Some(fault) = reply.error {
                return Err(fault.into());
            }
            reply
                .value
                .map(Reply::Value)
                .ok_or_else(|| ClientError::protocol("property reply is missing `value`"))
        }
        RequestKind::SetProperty => {
            let reply = parse_property_reply(payload)?;
            match reply.error {
                Some(fault) => Err(fault.into()),
                None => Ok(Reply::Ack),
            }
        }
        RequestKind::Enroll | RequestKind::EnrollCtrl => {
            let reply: EnrollReply = serde_json::from_slice(payload)
                .map_err(|e| ClientError::protocol(format!("invalid enroll reply: {e}")))?;
            if let Some(fault) = reply.error {
                return Err(fault.into());
            }
            match (reply.id, reply.auth) {
                (Some(plug_id), Some(auth)) if !plug_id.is_empty() && !auth.is_empty() => {
                    Ok(Reply::Enrolled(EnrollCredentials { plug_id, auth }))
                }
                _ => Err(ClientError::protocol(
                    "enroll reply is missing `id` or `auth`",
                )),
            }
        }
    }
}

fn parse_property_reply(payload: &[u8]) -> Result<PropertyReply, ClientError> {
    serde_json::from_slice(payload)
        .map_err(|e| ClientError::protocol(format!("invalid property reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_record_embeds_json_message() {
        let record = DataRecord::from_message(r#"{"temp": 21.5}"#, Some(60));
        assert_eq!(record.data, json!({"temp": 21.5}));
        let payload: Value = serde_json::from_slice(&record.to_payload().unwrap()).unwrap();
        assert_eq!(payload, json!({"data": {"temp": 21.5}, "ttl": 60}));
    }

    #[test]
    fn test_data_record_plain_text_message() {
        let record = DataRecord::from_message("hello", Some(60));
        let payload: Value = serde_json::from_slice(&record.to_payload().unwrap()).unwrap();
        assert_eq!(payload, json!({"data": "hello", "ttl": 60}));
    }

    #[test]
    fn test_data_record_keeps_ttl_next_to_expire_at() {
        let record =
            DataRecord::from_message(r#"{"v": 1, "expire_at": 1700000000}"#, Some(30));
        let payload: Value = serde_json::from_slice(&record.to_payload().unwrap()).unwrap();
        assert_eq!(payload["ttl"], 30);
        assert_eq!(payload["data"]["expire_at"], 1700000000);
    }

    #[test]
    fn test_data_record_without_ttl() {
        let record = DataRecord::from_message("42", None);
        let payload: Value = serde_json::from_slice(&record.to_payload().unwrap()).unwrap();
        assert_eq!(payload, json!({"data": 42}));
    }

    #[test]
    fn test_property_request_payloads() {
        let get: Value =
            serde_json::from_slice(&PropertyRequest::get("c1", "k").to_payload().unwrap())
                .unwrap();
        assert_eq!(get, json!({"cid": "c1", "key": "k"}));

        let set: Value = serde_json::from_slice(
            &PropertyRequest::set("c2", "k", json!("v"))
                .to_payload()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(set, json!({"cid": "c2", "key": "k", "value": "v"}));
    }

    #[test]
    fn test_enroll_request_payload() {
        let request = EnrollRequest {
            hwid: "HW-1".to_string(),
            model: "model-7".to_string(),
            pass: "pw".to_string(),
            ctrl: None,
        };
        let payload: Value = serde_json::from_slice(&request.to_payload().unwrap()).unwrap();
        assert_eq!(payload, json!({"hwid": "HW-1", "model": "model-7", "pass": "pw"}));
    }

    #[test]
    fn test_correlation_id_extraction() {
        assert_eq!(
            correlation_id(br#"{"cid": "abc", "value": 1}"#),
            Some("abc".to_string())
        );
        assert_eq!(correlation_id(br#"{"value": 1}"#), None);
        assert_eq!(correlation_id(br#"{"cid": ""}"#), None);
        assert_eq!(correlation_id(br#"{"cid": 7}"#), None);
        assert_eq!(correlation_id(b"not json"), None);
    }

    #[test]
    fn test_decode_get_reply() {
        let reply = decode_reply(
            RequestKind::GetProperty,
            br#"{"cid": "c", "key": "k", "value": "v"}"#,
        )
        .unwrap();
        assert_eq!(reply, Reply::Value(json!("v")));
    }

    #[test]
    fn test_decode_get_reply_missing_value_is_protocol_error() {
        let result = decode_reply(RequestKind::GetProperty, br#"{"cid": "c", "key": "k"}"#);
        assert!(matches!(result, Err(ClientError::Protocol { .. })));
    }

    #[test]
    fn test_decode_set_reply() {
        assert_eq!(
            decode_reply(RequestKind::SetProperty, br#"{"cid": "c"}"#).unwrap(),
            Reply::Ack
        );
    }

    #[test]
    fn test_decode_remote_fault() {
        let result = decode_reply(
            RequestKind::SetProperty,
            br#"{"cid": "c", "error": {"code": 403, "message": "read-only property"}}"#,
        );
        match result {
            Err(ClientError::Rejected { code, message }) => {
                assert_eq!(code, Some(403));
                assert_eq!(message, "read-only property");
            }
            other => panic!("Expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_enroll_reply() {
        let reply = decode_reply(RequestKind::Enroll, br#"{"id": "dev-1", "auth": "tok"}"#)
            .unwrap();
        assert_eq!(
            reply,
            Reply::Enrolled(EnrollCredentials {
                plug_id: "dev-1".to_string(),
                auth: "tok".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_enroll_reply_missing_auth() {
        let result = decode_reply(RequestKind::EnrollCtrl, br#"{"id": "dev-1"}"#);
        assert!(matches!(result, Err(ClientError::Protocol { .. })));

        let result = decode_reply(RequestKind::Enroll, b"garbage");
        assert!(matches!(result, Err(ClientError::Protocol { .. })));
    }
}
