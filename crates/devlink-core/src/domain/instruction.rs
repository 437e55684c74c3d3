//! Instruction descriptions and the codec seam for device wire formats.
//!
//! The engine never interprets device bytes itself.  Each instruction carries
//! an [`InstructionCodec`] supplied from outside that knows how to encode the
//! request for a particular device and how to decode a response frame into
//! named values.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::description::DeviceDescription;

/// Why an instruction did not complete successfully.
///
/// Callers of synchronous execution only ever see `success == false` on the
/// returned context; the variant is used for logging and for feeding the
/// connection-health policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("device rejected instruction: {0}")]
    Nack(String),
    #[error("evicted from a full queue")]
    Evicted,
    #[error("device is offline")]
    Offline,
    #[error("pool shut down before dispatch")]
    Shutdown,
}

impl InstructionError {
    /// Whether this failure says something about the device link and should
    /// count towards the offline detection threshold.
    pub fn affects_health(&self) -> bool {
        matches!(
            self,
            InstructionError::Timeout(_)
                | InstructionError::Send(_)
                | InstructionError::Decode(_)
                | InstructionError::Nack(_)
        )
    }
}

/// Result of offering one frame to a codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The frame answers the outstanding request.
    Complete(Map<String, Value>),
    /// The frame is not (yet) the answer; keep waiting.
    Partial,
}

/// Device-specific request/response encoding.
pub trait InstructionCodec: Send + Sync + fmt::Debug {
    fn encode(&self, device: &DeviceDescription) -> Result<Vec<u8>, InstructionError>;

    fn decode(&self, device: &DeviceDescription, frame: &[u8]) -> Result<Decoded, InstructionError>;
}

/// Codec that sends a fixed payload and accepts any non-empty response,
/// exposing it as `{"response": [bytes...]}`.
///
/// Useful for keep-alive polls and for transports whose payloads are
/// interpreted further downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBytesCodec {
    payload: Vec<u8>,
    expected_prefix: Option<Vec<u8>>,
}

impl FixedBytesCodec {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            expected_prefix: None,
        }
    }

    /// Only frames starting with `prefix` complete the request.
    pub fn expecting_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.expected_prefix = Some(prefix.into());
        self
    }
}

impl InstructionCodec for FixedBytesCodec {
    fn encode(&self, _device: &DeviceDescription) -> Result<Vec<u8>, InstructionError> {
        Ok(self.payload.clone())
    }

    fn decode(&self, _device: &DeviceDescription, frame: &[u8]) -> Result<Decoded, InstructionError> {
        if frame.is_empty() {
            return Err(InstructionError::Decode("empty frame".to_string()));
        }
        if let Some(prefix) = &self.expected_prefix {
            if !frame.starts_with(prefix) {
                return Ok(Decoded::Partial);
            }
        }
        let mut values = Map::new();
        values.insert(
            "response".to_string(),
            Value::Array(frame.iter().map(|b| Value::from(*b)).collect()),
        );
        Ok(Decoded::Complete(values))
    }
}

/// Read-only request template.
///
/// Cheap to clone: the codec is shared behind an `Arc`.
#[derive(Clone)]
pub struct InstructionDescription {
    pub name: String,
    pub codec: Arc<dyn InstructionCodec>,
    /// Overrides the device/channel timeout for this instruction.
    pub timeout: Option<Duration>,
    /// `false` for notifications that complete as soon as they are sent.
    pub expects_response: bool,
}

impl InstructionDescription {
    pub fn new(name: impl Into<String>, codec: Arc<dyn InstructionCodec>) -> Self {
        Self {
            name: name.into(),
            codec,
            timeout: None,
            expects_response: true,
        }
    }

    /// Instruction whose request is always `payload`.
    pub fn fixed(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(name, Arc::new(FixedBytesCodec::new(payload)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_response(mut self) -> Self {
        self.expects_response = false;
        self
    }
}

impl fmt::Debug for InstructionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionDescription")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("expects_response", &self.expects_response)
            .finish()
    }
}
