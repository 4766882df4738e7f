use serde::{Deserialize, Serialize};

/// Type tag the receive endpoint is bound to
pub const MESSAGE_TYPE: &str = "TestMessage";

/// Single-field payload exchanged by the harness. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    message: String,
}

impl TestMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// JSON wire form: `{"message":"..."}`
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let encoded = TestMessage::new("hello").encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, serde_json::json!({ "message": "hello" }));
    }

    #[test]
    fn test_decode_rejects_foreign_payloads() {
        assert!(TestMessage::decode(b"plain text").is_err());
        assert!(TestMessage::decode(br#"{"other":"field"}"#).is_err());
    }

    #[test]
    fn test_decode_unicode() {
        let message = TestMessage::decode("{\"message\":\"测试 📢\"}".as_bytes()).unwrap();
        assert_eq!(message.message(), "测试 📢");
    }
}
