#![warn(clippy::pedantic)]
#![warn(clippy::all)]

//! Wire format of the ICL service: JSON request/reply envelopes, one command
//! in flight at a time. A reply whose `errors` array is non-empty means the
//! command was rejected by the service or the device behind it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, command: &str, parameters: Value) -> Self {
        Request {
            id,
            command: command.to_owned(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Reply {
    /// Consume the reply, yielding its `results` object.
    /// # Errors
    /// Returns ``IclError::Device`` if the service reported any errors for
    /// this command.
    pub fn into_results(self) -> IclResult<Value> {
        if self.errors.is_empty() {
            Ok(self.results)
        } else {
            Err(IclError::Device {
                command: self.command,
                errors: self.errors,
            })
        }
    }
}

#[derive(Error, Debug)]
pub enum IclError {
    #[error("cannot reach the ICL at {addr} ({source}); is the instrument service installed, licensed and running?")]
    Unreachable {
        addr: String,
        source: std::io::Error,
    },
    #[error("i/o failure on the ICL connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("the ICL closed the connection")]
    Closed,
    #[error("malformed ICL message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("reply id {got} does not match request id {want}")]
    IdMismatch { want: u64, got: u64 },
    #[error("{command} failed: {}", .errors.join("; "))]
    Device { command: String, errors: Vec<String> },
    #[error("no reply to {command} within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("device still busy after {limit_ms} ms waiting on {operation}")]
    BusyTimeout {
        operation: &'static str,
        limit_ms: u64,
    },
    #[error("the ICL reports no {kind}")]
    NoDevice { kind: &'static str },
    #[error("missing or mistyped field `{field}` in {command} results")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    #[error("xData and yData lengths differ ({x} vs {y})")]
    DataShape { x: usize, y: usize },
    #[error("failed to launch the ICL process `{exe}`: {source}")]
    Spawn {
        exe: String,
        source: std::io::Error,
    },
}

pub type IclResult<T> = Result<T, IclError>;

// Typed accessors into a `results` object. The ICL is loose about integer
// vs float encoding, so numbers are accepted in either form.

pub(crate) fn field_f64(results: &Value, command: &'static str, field: &'static str) -> IclResult<f64> {
    results
        .get(field)
        .and_then(Value::as_f64)
        .ok_or(IclError::MissingField { command, field })
}

pub(crate) fn field_u32(results: &Value, command: &'static str, field: &'static str) -> IclResult<u32> {
    results
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or(IclError::MissingField { command, field })
}

pub(crate) fn field_bool(results: &Value, command: &'static str, field: &'static str) -> IclResult<bool> {
    results
        .get(field)
        .and_then(Value::as_bool)
        .ok_or(IclError::MissingField { command, field })
}

pub(crate) fn field_f64_array(
    value: &Value,
    command: &'static str,
    field: &'static str,
) -> IclResult<Vec<f64>> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_f64).collect::<Vec<f64>>())
        .ok_or(IclError::MissingField { command, field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = Request::new(7, "mono_moveToPosition", json!({"index": 0, "wavelength": 545.0}));
        let text = serde_json::to_string(&req).expect("should serialize");
        let round: Value = serde_json::from_str(&text).expect("should parse");
        assert_eq!(round["id"], 7);
        assert_eq!(round["command"], "mono_moveToPosition");
        assert_eq!(round["parameters"]["wavelength"], 545.0);
    }

    #[test]
    fn reply_with_errors_is_rejected() {
        let text = r#"{"id": 3, "command": "ccd_open", "results": {}, "errors": ["[E];-510;device not found"]}"#;
        let reply: Reply = serde_json::from_str(text).expect("should parse");
        match reply.into_results() {
            Err(IclError::Device { command, errors }) => {
                assert_eq!(command, "ccd_open");
                assert_eq!(errors.len(), 1);
            }
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[test]
    fn reply_defaults_missing_sections() {
        let text = r#"{"id": 1, "command": "icl_binMode"}"#;
        let reply: Reply = serde_json::from_str(text).expect("should parse");
        assert!(reply.errors.is_empty());
        assert!(reply.into_results().expect("no errors").is_null());
    }

    #[test]
    fn field_accessors() {
        let results = json!({"wavelength": 545.5, "busy": false, "x": 1024, "xData": [1.0, 2.0]});
        assert!((field_f64(&results, "cmd", "wavelength").expect("present") - 545.5).abs() < f64::EPSILON);
        assert!(!field_bool(&results, "cmd", "busy").expect("present"));
        assert_eq!(field_u32(&results, "cmd", "x").expect("present"), 1024);
        assert_eq!(field_f64_array(&results, "cmd", "xData").expect("present"), vec![1.0, 2.0]);
        assert!(matches!(
            field_f64(&results, "cmd", "absent"),
            Err(IclError::MissingField { field: "absent", .. })
        ));
    }
}
