//! Outcome of one dispatched instruction.

use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};

/// Success flag, decoded values and completion time of one packet.
///
/// A failed context carries no values; the reason is kept only as a message
/// for logs, so callers cannot branch on distinct error types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionContext {
    pub device: String,
    pub instruction: String,
    pub success: bool,
    pub values: Map<String, Value>,
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InstructionContext {
    pub fn success(
        device: impl Into<String>,
        instruction: impl Into<String>,
        values: Map<String, Value>,
    ) -> Self {
        Self {
            device: device.into(),
            instruction: instruction.into(),
            success: true,
            values,
            timestamp: SystemTime::now(),
            message: None,
        }
    }

    pub fn failure(
        device: impl Into<String>,
        instruction: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            instruction: instruction.into(),
            success: false,
            values: Map::new(),
            timestamp: SystemTime::now(),
            message: Some(message.into()),
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_context_has_no_values() {
        let ctx = InstructionContext::failure("meter", "read", "timeout");
        assert!(!ctx.success);
        assert!(ctx.values.is_empty());
        assert_eq!(ctx.message.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_success_context_exposes_values() {
        let mut values = Map::new();
        values.insert("voltage".to_string(), Value::from(231));
        let ctx = InstructionContext::success("meter", "read", values);
        assert!(ctx.success);
        assert_eq!(ctx.value("voltage"), Some(&Value::from(231)));
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("message").is_none());
    }
}
