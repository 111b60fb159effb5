//! Procedure parameter model.
//!
//! A [`Parameter`] is one positional slot of a procedure call as the caller
//! declared it. Types follow the backend's own numbering so they can be handed
//! to the wire unchanged, with two exceptions resolved by [`resolve_type`]:
//! `Undefined` (inferred from the direction) and the synthetic `JSON` type
//! (always transported as a memory pointer).
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel shown instead of redacted values.
pub const REDACTED_VALUE: &str = "***";

static LABEL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-zA-Z0-9-]*$").expect("label pattern is valid"));

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParameterType {
    #[default]
    Undefined,
    String,
    Date,
    #[serde(alias = "Bool")]
    Boolean,
    #[serde(alias = "Int")]
    Integer,
    Decimal,
    Long,
    #[serde(alias = "Integer64")]
    Int64,
    Byte,
    Handle,
    #[serde(alias = "File")]
    MemPointer,
    RowId,
    #[serde(rename = "COMHandle")]
    ComHandle,
    DataTable,
    DynDataTable,
    DataSet,
    DynDataSet,
    DateTime,
    #[serde(rename = "DateTimeTZ")]
    DateTimeTz,
    LongChar,
    #[serde(rename = "JSON")]
    Json,
}

impl ParameterType {
    /// Numeric type code understood by the backend.
    pub const fn wire_code(self) -> i32 {
        match self {
            ParameterType::Undefined => 0,
            ParameterType::String => 1,
            ParameterType::Date => 2,
            ParameterType::Boolean => 3,
            ParameterType::Integer => 4,
            ParameterType::Decimal => 5,
            ParameterType::Long => 7,
            ParameterType::Byte => 8,
            ParameterType::Handle => 10,
            ParameterType::MemPointer => 11,
            ParameterType::RowId => 13,
            ParameterType::ComHandle => 14,
            ParameterType::DataTable => 15,
            ParameterType::DynDataTable => 17,
            ParameterType::DateTime => 34,
            ParameterType::DataSet => 36,
            ParameterType::DynDataSet => 37,
            ParameterType::LongChar => 39,
            ParameterType::DateTimeTz => 40,
            ParameterType::Int64 => 41,
            ParameterType::Json => 15001,
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome of resolving a declared type for marshalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedType {
    /// Effective logical type (`Undefined` replaced by its default).
    pub parameter_type: ParameterType,
    /// Type put on the wire (`Json` replaced by `MemPointer`).
    pub wire_type: ParameterType,
    /// Whether `parameter_type` was inferred from `Undefined`.
    pub inferred: bool,
}

/// Resolve a declared type: `Undefined` becomes `String` for inputs and
/// `Json` for outputs, and `Json` is always carried as a memory pointer.
pub const fn resolve_type(declared: ParameterType, output: bool) -> ResolvedType {
    let (parameter_type, inferred) = match declared {
        ParameterType::Undefined if output => (ParameterType::Json, true),
        ParameterType::Undefined => (ParameterType::String, true),
        other => (other, false),
    };

    let wire_type = match parameter_type {
        ParameterType::Json => ParameterType::MemPointer,
        other => other,
    };

    ResolvedType {
        parameter_type,
        wire_type,
        inferred,
    }
}

/// One positional parameter of a procedure request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// 1-based position
    #[serde(rename = "pos")]
    pub position: u16,
    /// Output key, used when it matches the label pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default, rename = "type")]
    pub parameter_type: ParameterType,
    /// Hide the value from logs and from the cache fingerprint
    #[serde(default)]
    pub redact: bool,
    #[serde(default, rename = "out")]
    pub output: bool,
    /// Keep single-element JSON arrays as arrays
    #[serde(default, rename = "ar")]
    pub force_array: bool,
}

impl Parameter {
    /// Input parameter bound to `value`.
    pub fn input(position: u16, value: Value) -> Self {
        Self {
            position,
            value: Some(value),
            ..Self::default()
        }
    }

    /// Output parameter without a value.
    pub fn output(position: u16) -> Self {
        Self {
            position,
            output: true,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_type(mut self, parameter_type: ParameterType) -> Self {
        self.parameter_type = parameter_type;
        self
    }

    pub fn redacted(mut self) -> Self {
        self.redact = true;
        self
    }

    pub fn forcing_array(mut self) -> Self {
        self.force_array = true;
        self
    }

    /// Whether a label is present and usable as an output key.
    pub fn has_label(&self) -> bool {
        self.label
            .as_deref()
            .is_some_and(|label| LABEL_PATTERN.is_match(label))
    }

    /// Output key: the label when usable, the position otherwise.
    pub fn response_label(&self) -> String {
        match &self.label {
            Some(label) if self.has_label() => label.clone(),
            _ => self.position.to_string(),
        }
    }

    /// Whether a non-null value is bound.
    pub fn has_value(&self) -> bool {
        self.value.as_ref().is_some_and(|value| !value.is_null())
    }

    pub fn resolved_type(&self) -> ResolvedType {
        resolve_type(self.parameter_type, self.output)
    }
}

/// Log-safe projection of a [`Parameter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayableParameter {
    pub position: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Raw JSON text of the value, or the redaction sentinel
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub parameter_type: ParameterType,
    pub redact: bool,
    #[serde(rename = "out")]
    pub output: bool,
    #[serde(rename = "ar")]
    pub force_array: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_undefined_input_resolves_to_string() {
        let resolved = resolve_type(ParameterType::Undefined, false);
        assert_eq!(resolved.parameter_type, ParameterType::String);
        assert_eq!(resolved.wire_type, ParameterType::String);
        assert!(resolved.inferred);
    }

    #[test]
    fn test_undefined_output_resolves_to_json_on_mem_pointer() {
        let resolved = resolve_type(ParameterType::Undefined, true);
        assert_eq!(resolved.parameter_type, ParameterType::Json);
        assert_eq!(resolved.wire_type, ParameterType::MemPointer);
        assert!(resolved.inferred);
    }

    #[test]
    fn test_json_always_maps_to_mem_pointer() {
        for output in [true, false] {
            let resolved = resolve_type(ParameterType::Json, output);
            assert_eq!(resolved.parameter_type, ParameterType::Json);
            assert_eq!(resolved.wire_type, ParameterType::MemPointer);
            assert!(!resolved.inferred);
        }
    }

    #[test]
    fn test_declared_types_pass_through() {
        let resolved = resolve_type(ParameterType::Integer, true);
        assert_eq!(resolved.wire_type, ParameterType::Integer);
        assert_eq!(resolved.wire_type.wire_code(), 4);
        assert!(!resolved.inferred);
    }

    #[test]
    fn test_response_label_falls_back_to_position() {
        assert_eq!(Parameter::output(3).response_label(), "3");
        assert_eq!(
            Parameter::output(3).with_label("customerName").response_label(),
            "customerName"
        );
        // Labels must start with a lowercase letter
        assert_eq!(Parameter::output(4).with_label("Name").response_label(), "4");
        assert!(!Parameter::output(5).with_label("").has_label());
    }

    #[test]
    fn test_deserialize_wire_names_and_aliases() {
        let parameter: Parameter = serde_json::from_value(json!({
            "pos": 2,
            "label": "rows",
            "value": [1, 2],
            "type": "Int",
            "out": true,
            "ar": true
        }))
        .unwrap();

        assert_eq!(parameter.position, 2);
        assert_eq!(parameter.parameter_type, ParameterType::Integer);
        assert!(parameter.output);
        assert!(parameter.force_array);
        assert!(!parameter.redact);

        let parameter: Parameter =
            serde_json::from_value(json!({ "pos": 1, "type": "JSON", "value": null })).unwrap();
        assert_eq!(parameter.parameter_type, ParameterType::Json);
        assert!(!parameter.has_value());
    }
}
