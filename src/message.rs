// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Messages
//!
//! The unit of work exchanged between publishers and workers, and its JSON
//! wire encoding.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type stamped on every published task.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode marking a message as persistent.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// String-valued message headers, also used as header-exchange binding arguments.
pub type MessageHeaders = BTreeMap<String, String>;

/// A task handed to the broker by a caller and consumed by a worker.
///
/// `id` is for traceability only; it is not a deduplication key. `data` is
/// passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub id: String,
    pub action: String,
    pub data: Map<String, Value>,
}

impl TaskPayload {
    /// Creates a task with a freshly generated v4 UUID.
    pub fn new(action: &str, data: Map<String, Value>) -> TaskPayload {
        TaskPayload {
            id: Uuid::new_v4().to_string(),
            action: action.to_owned(),
            data,
        }
    }

    /// Encodes the task as a UTF-8 JSON object.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(self).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// Decodes a delivered body.
    pub fn from_bytes(body: &[u8]) -> Result<TaskPayload, AmqpError> {
        serde_json::from_slice(body).map_err(|err| AmqpError::MalformedMessageError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TaskPayload {
        let Value::Object(data) = json!({
            "level": "error",
            "tags": ["db", "timeout"],
            "attempt": 2,
            "nested": { "ok": false }
        }) else {
            unreachable!()
        };

        TaskPayload::new("process_log", data)
    }

    #[test]
    fn new_generates_distinct_ids() {
        let a = TaskPayload::new("process_log", Map::new());
        let b = TaskPayload::new("process_log", Map::new());

        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn wire_format_is_a_flat_json_object() {
        let task = sample();
        let value: Value = serde_json::from_slice(&task.to_bytes().unwrap()).unwrap();

        assert_eq!(value["id"], json!(task.id));
        assert_eq!(value["action"], json!("process_log"));
        assert_eq!(value["data"]["tags"], json!(["db", "timeout"]));
    }

    #[test]
    fn decoding_preserves_every_field() {
        let task = sample();

        assert_eq!(TaskPayload::from_bytes(&task.to_bytes().unwrap()).unwrap(), task);
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = TaskPayload::from_bytes(b"definitely not json").unwrap_err();

        assert!(matches!(err, AmqpError::MalformedMessageError(_)));
    }

    #[test]
    fn json_with_wrong_shape_is_malformed() {
        let err = TaskPayload::from_bytes(br#"{"id": 7, "action": "x"}"#).unwrap_err();

        assert!(matches!(err, AmqpError::MalformedMessageError(_)));
    }
}
