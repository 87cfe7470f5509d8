//! Uniform response envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{success, data?, error?, stack?, code?}` as returned by every command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Diagnostic trace or driver detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The failure half of an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: (!data.is_null()).then_some(data),
            error: None,
            stack: None,
            code: None,
        }
    }

    pub fn err(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            stack: None,
            code: Some(code.into()),
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack;
        self
    }

    /// Unwrap the payload, keeping the remote message and trace on failure
    pub fn into_result(self) -> Result<Value, Failure> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(Failure {
                message: self
                    .error
                    .unwrap_or_else(|| "Request failed".to_string()),
                code: self.code,
                stack: self.stack,
            })
        }
    }
}
