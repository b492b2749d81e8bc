//! Typed decode of `Msvm_Error` embedded instances

use virtmgmt_core_interface::{Instance, ObjectPath, Value};

use crate::embedded::FromInstance;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct MsvmError {
    pub message: String,
    /// Numeric `MessageID`; 0 when absent or not numeric
    pub id: i64,
    pub error_type: u16,
    pub severity: u16,
    pub error_source: Option<ObjectPath>,
    pub arguments: Vec<String>,
}

impl FromInstance for MsvmError {
    const CLASS_NAME: &'static str = "Msvm_Error";

    fn from_instance(instance: &Instance) -> Result<Self> {
        let message = instance
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = instance
            .get("MessageID")
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .unwrap_or(0);
        let error_source = match instance.get("ErrorSource") {
            None | Some(Value::Null) => None,
            Some(Value::Reference(path)) => Some(path.clone()),
            Some(Value::Str(text)) if text.is_empty() => None,
            Some(Value::Str(text)) => Some(
                text.parse()
                    .map_err(|_| Error::invalid_value("ErrorSource", text, "an object path"))?,
            ),
            Some(other) => return Err(Error::invalid_value("ErrorSource", other, "an object path")),
        };
        let arguments = instance
            .get("MessageArguments")
            .and_then(Value::as_str_array)
            .map(|items| items.into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(MsvmError {
            message,
            id,
            error_type: u16_or_zero(instance, "ErrorType"),
            severity: u16_or_zero(instance, "PerceivedSeverity"),
            error_source,
            arguments,
        })
    }
}

fn u16_or_zero(instance: &Instance, name: &str) -> u16 {
    instance.get(name).and_then(Value::as_u16).unwrap_or(0)
}
