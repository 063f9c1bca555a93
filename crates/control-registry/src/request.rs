use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ControlError;

/// Addressed control operation: `{type, id, op, args}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

impl ControlRequest {
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        op: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            op: op.into(),
            args,
        }
    }

    /// Decodes and validates a request body.
    ///
    /// `args` may be omitted or `null`, both read as `{}`; any other non-object
    /// value is rejected.
    pub fn from_value(value: Value) -> Result<Self, ControlError> {
        if !value.is_object() {
            return Err(ControlError::Malformed(format!(
                "expected an object, got {}",
                json_kind(&value)
            )));
        }
        let mut request: ControlRequest = serde_json::from_value(value)
            .map_err(|err| ControlError::Malformed(err.to_string()))?;

        if request.args.is_null() {
            request.args = Value::Object(Map::new());
        } else if !request.args.is_object() {
            return Err(ControlError::Malformed(format!(
                "args must be an object, got {}",
                json_kind(&request.args)
            )));
        }

        for (field, value) in [
            ("type", &request.kind),
            ("id", &request.id),
            ("op", &request.op),
        ] {
            if value.trim().is_empty() {
                return Err(ControlError::Malformed(format!("`{field}` must not be empty")));
            }
        }

        Ok(request)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
