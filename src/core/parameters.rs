//! Parameter Service: maps request parameters onto a backend
//! [`ParameterSet`] and decodes the outputs back into JSON.
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    core::checksum::ChecksumService,
    models::{DisplayableParameter, Parameter, ParameterType, REDACTED_VALUE},
    ports::{ParameterDirection, ParameterSet, ParameterValue},
};

/// Errors raised while decoding procedure outputs
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ParameterError {
    #[error("Output at position {position} is not valid JSON: {source}")]
    InvalidJson {
        position: u16,
        #[source]
        source: serde_json::Error,
    },
}

/// Redaction-safe view of a request's parameters together with their
/// cache fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredParameters {
    /// Parameters ordered by position, redacted values replaced
    pub displayable: Vec<DisplayableParameter>,
    pub has_redacted: bool,
    /// `None` when nothing contributed to the fingerprint
    pub parameter_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterService {
    checksum: ChecksumService,
}

impl ParameterService {
    pub fn new(checksum: ChecksumService) -> Self {
        Self { checksum }
    }

    /// Build the displayable projection and the fingerprint of every
    /// non-redacted parameter. The input slice is left untouched.
    pub fn get_filtered_parameters(&self, parameters: &[Parameter]) -> FilteredParameters {
        let mut ordered: Vec<&Parameter> = parameters.iter().collect();
        ordered.sort_by_key(|parameter| parameter.position);

        let mut has_redacted = false;
        let mut buffer = String::with_capacity(parameters.len() * 64);
        let mut displayable = Vec::with_capacity(ordered.len());

        for parameter in ordered {
            let raw_value = parameter
                .value
                .as_ref()
                .filter(|value| !value.is_null())
                .map(Value::to_string);

            let shown_value = if parameter.output {
                buffer.push_str(&parameter.position.to_string());
                buffer.push(if parameter.force_array { '1' } else { '0' });
                raw_value
            } else if parameter.redact {
                has_redacted = true;
                Some(REDACTED_VALUE.to_string())
            } else {
                buffer.push_str(&parameter.position.to_string());
                if let Some(raw) = &raw_value {
                    buffer.push_str(raw);
                }
                raw_value
            };

            displayable.push(DisplayableParameter {
                position: parameter.position,
                label: parameter.label.clone(),
                value: shown_value,
                parameter_type: parameter.parameter_type,
                redact: parameter.redact,
                output: parameter.output,
                force_array: parameter.force_array,
            });
        }

        let parameter_hash = (!buffer.is_empty()).then(|| self.checksum.generate(&buffer));

        FilteredParameters {
            displayable,
            has_redacted,
            parameter_hash,
        }
    }

    /// Bind every request parameter to a slot of a fresh parameter set.
    pub fn generate_parameter_set(&self, parameters: &[Parameter]) -> ParameterSet {
        let mut set = ParameterSet::new();

        for parameter in parameters {
            let resolved = parameter.resolved_type();
            let direction = if parameter.output {
                ParameterDirection::Output
            } else {
                ParameterDirection::Input
            };

            match parameter.value.as_ref().filter(|value| !value.is_null()) {
                Some(value) if !parameter.output && resolved.parameter_type == ParameterType::Json => {
                    set.set_parameter(
                        parameter.position,
                        ParameterValue::MemPointer(value.to_string().into_bytes()),
                        direction,
                        resolved.wire_type,
                        false,
                        0,
                    );
                }
                Some(Value::Array(items)) => {
                    let values: Vec<ParameterValue> =
                        items.iter().map(ParameterValue::from_json).collect();
                    let extent = values.len();
                    set.set_parameter(
                        parameter.position,
                        ParameterValue::Array(values),
                        direction,
                        resolved.wire_type,
                        extent > 0,
                        extent,
                    );
                }
                Some(value) => {
                    set.set_parameter(
                        parameter.position,
                        ParameterValue::from_json(value),
                        direction,
                        resolved.wire_type,
                        false,
                        0,
                    );
                }
                None => {
                    set.set_parameter(
                        parameter.position,
                        ParameterValue::Null,
                        direction,
                        resolved.wire_type,
                        false,
                        0,
                    );
                }
            }
        }

        set
    }

    /// Decode the output bound to `parameter`.
    ///
    /// JSON memory pointers are parsed, and a single-element array is
    /// unwrapped unless the parameter forces arrays. Other memory pointers
    /// come back as base64 and long character outputs are parsed as JSON.
    pub fn extract_and_parse_value(
        &self,
        parameter: &Parameter,
        parameters: &ParameterSet,
    ) -> Result<Value, ParameterError> {
        let Some(raw) = parameters.output_parameter(parameter.position) else {
            return Ok(Value::Null);
        };
        let parameter_type = parameter.resolved_type().parameter_type;

        match raw {
            ParameterValue::MemPointer(bytes) if parameter_type == ParameterType::Json => {
                if bytes.is_empty() {
                    return Ok(Value::Null);
                }

                let parsed: Value = serde_json::from_slice(bytes).map_err(|source| {
                    ParameterError::InvalidJson {
                        position: parameter.position,
                        source,
                    }
                })?;

                match parsed {
                    Value::Array(mut items) if items.len() == 1 && !parameter.force_array => {
                        Ok(items.remove(0))
                    }
                    other => Ok(other),
                }
            }
            ParameterValue::Text(text) if parameter_type == ParameterType::LongChar => {
                serde_json::from_str(text).map_err(|source| ParameterError::InvalidJson {
                    position: parameter.position,
                    source,
                })
            }
            other => Ok(other.clone().into_json()),
        }
    }

    /// Collect outputs keyed by label, or by position when unlabeled. A
    /// lone unlabeled output is keyed by the empty string.
    pub fn get_output_parameters(
        &self,
        request_parameters: &[Parameter],
        parameters: &ParameterSet,
    ) -> Result<Map<String, Value>, ParameterError> {
        let outputs: Vec<&Parameter> = request_parameters
            .iter()
            .filter(|parameter| parameter.output)
            .collect();

        let mut values = Map::with_capacity(outputs.len());
        if let [single] = outputs.as_slice() {
            if !single.has_label() {
                values.insert(
                    String::new(),
                    self.extract_and_parse_value(single, parameters)?,
                );
                return Ok(values);
            }
        }

        for parameter in outputs {
            values.insert(
                parameter.response_label(),
                self.extract_and_parse_value(parameter, parameters)?,
            );
        }

        Ok(values)
    }

    /// Collapse a lone empty-keyed output into its bare value.
    pub fn get_parsed_outputs(&self, outputs: Map<String, Value>) -> Value {
        if outputs.len() == 1 && outputs.contains_key("") {
            return outputs.into_iter().next().map(|(_, value)| value).unwrap_or_default();
        }

        Value::Object(outputs)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn service() -> ParameterService {
        ParameterService::new(ChecksumService::new())
    }

    #[test]
    fn test_hash_is_independent_of_declaration_order() {
        let service = service();
        let forward = vec![
            Parameter::input(1, json!("abc")),
            Parameter::input(2, json!(42)),
            Parameter::output(3),
        ];
        let backward: Vec<Parameter> = forward.iter().rev().cloned().collect();

        let first = service.get_filtered_parameters(&forward);
        let second = service.get_filtered_parameters(&backward);

        assert!(first.parameter_hash.is_some());
        assert_eq!(first.parameter_hash, second.parameter_hash);
        assert_eq!(first.displayable, second.displayable);
        assert_eq!(
            first
                .displayable
                .iter()
                .map(|parameter| parameter.position)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_hash_matches_buffer_layout() {
        let service = service();
        let filtered = service.get_filtered_parameters(&[
            Parameter::input(1, json!("abc")),
            Parameter::output(2).forcing_array(),
        ]);

        assert_eq!(
            filtered.parameter_hash,
            Some(ChecksumService::new().generate("1\"abc\"21"))
        );
    }

    #[test]
    fn test_redacted_values_do_not_reach_the_hash() {
        let service = service();
        let public = Parameter::input(1, json!("visible"));

        let first = service.get_filtered_parameters(&[
            public.clone(),
            Parameter::input(2, json!("secret-a")).redacted(),
        ]);
        let second = service.get_filtered_parameters(&[
            public.clone(),
            Parameter::input(2, json!("secret-b")).redacted(),
        ]);
        let without = service.get_filtered_parameters(&[public]);

        assert!(first.has_redacted);
        assert_eq!(first.parameter_hash, second.parameter_hash);
        assert_eq!(first.parameter_hash, without.parameter_hash);
        assert_eq!(first.displayable[1].value.as_deref(), Some(REDACTED_VALUE));
        assert!(!without.has_redacted);
    }

    #[test]
    fn test_only_redacted_inputs_produce_no_hash() {
        let service = service();
        let filtered =
            service.get_filtered_parameters(&[Parameter::input(1, json!("pw")).redacted()]);

        assert_eq!(filtered.parameter_hash, None);
        assert!(service.get_filtered_parameters(&[]).parameter_hash.is_none());
    }

    #[test]
    fn test_filtering_does_not_mutate_request() {
        let service = service();
        let parameters = vec![Parameter::input(1, json!("pw")).redacted()];
        let before = parameters.clone();

        service.get_filtered_parameters(&parameters);

        assert_eq!(parameters, before);
    }

    #[test]
    fn test_parameter_set_binding() {
        let service = service();
        let set = service.generate_parameter_set(&[
            Parameter::input(1, json!({ "id": 7 })).with_type(ParameterType::Json),
            Parameter::input(2, json!([1, 2, 3])).with_type(ParameterType::Integer),
            Parameter::input(3, json!("text")),
            Parameter::input(4, Value::Null).with_type(ParameterType::Decimal),
            Parameter::output(5),
            Parameter::input(6, json!([])).with_type(ParameterType::Integer),
        ]);

        let json_slot = set.slot(1).unwrap();
        assert_eq!(json_slot.wire_type, ParameterType::MemPointer);
        assert_eq!(
            json_slot.value,
            ParameterValue::MemPointer(br#"{"id":7}"#.to_vec())
        );

        let array_slot = set.slot(2).unwrap();
        assert!(array_slot.is_array);
        assert_eq!(array_slot.extent, 3);

        let text_slot = set.slot(3).unwrap();
        assert_eq!(text_slot.wire_type, ParameterType::String);
        assert_eq!(text_slot.value, ParameterValue::Text("text".to_string()));

        let null_slot = set.slot(4).unwrap();
        assert_eq!(null_slot.direction, ParameterDirection::Input);
        assert_eq!(null_slot.wire_type, ParameterType::Decimal);
        assert!(null_slot.value.is_null());

        let output_slot = set.slot(5).unwrap();
        assert_eq!(output_slot.direction, ParameterDirection::Output);
        assert_eq!(output_slot.wire_type, ParameterType::MemPointer);

        let empty_array = set.slot(6).unwrap();
        assert!(!empty_array.is_array);
        assert_eq!(empty_array.extent, 0);
    }

    fn set_with_output(position: u16, wire_type: ParameterType, value: ParameterValue) -> ParameterSet {
        let mut set = ParameterSet::new();
        set.set_parameter(
            position,
            ParameterValue::Null,
            ParameterDirection::Output,
            wire_type,
            false,
            0,
        );
        set.set_output(position, value).unwrap();
        set
    }

    #[test]
    fn test_single_element_json_array_is_unwrapped() {
        let service = service();
        let set = set_with_output(
            1,
            ParameterType::MemPointer,
            ParameterValue::MemPointer(br#"[{"id":1}]"#.to_vec()),
        );

        let value = service
            .extract_and_parse_value(&Parameter::output(1), &set)
            .unwrap();
        assert_eq!(value, json!({ "id": 1 }));

        let value = service
            .extract_and_parse_value(&Parameter::output(1).forcing_array(), &set)
            .unwrap();
        assert_eq!(value, json!([{ "id": 1 }]));
    }

    #[test]
    fn test_empty_json_pointer_is_null() {
        let service = service();
        let set = set_with_output(1, ParameterType::MemPointer, ParameterValue::MemPointer(vec![]));

        assert_eq!(
            service
                .extract_and_parse_value(&Parameter::output(1), &set)
                .unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_long_char_and_raw_pointer_outputs() {
        let service = service();
        let set = set_with_output(
            1,
            ParameterType::LongChar,
            ParameterValue::Text(r#"{"ok":true}"#.to_string()),
        );
        let parameter = Parameter::output(1).with_type(ParameterType::LongChar);
        assert_eq!(
            service.extract_and_parse_value(&parameter, &set).unwrap(),
            json!({ "ok": true })
        );

        let set = set_with_output(
            2,
            ParameterType::MemPointer,
            ParameterValue::MemPointer(b"hi".to_vec()),
        );
        let parameter = Parameter::output(2).with_type(ParameterType::MemPointer);
        assert_eq!(
            service.extract_and_parse_value(&parameter, &set).unwrap(),
            json!("aGk=")
        );
    }

    #[test]
    fn test_invalid_json_output_is_an_error() {
        let service = service();
        let set = set_with_output(
            1,
            ParameterType::MemPointer,
            ParameterValue::MemPointer(b"{not json".to_vec()),
        );

        assert!(matches!(
            service.extract_and_parse_value(&Parameter::output(1), &set),
            Err(ParameterError::InvalidJson { position: 1, .. })
        ));
    }

    #[test]
    fn test_single_unlabeled_output_collapses() {
        let service = service();
        let request = vec![Parameter::input(1, json!("x")), Parameter::output(2)];
        let set = set_with_output(
            2,
            ParameterType::MemPointer,
            ParameterValue::MemPointer(br#"{"name":"Ann"}"#.to_vec()),
        );

        let outputs = service.get_output_parameters(&request, &set).unwrap();
        assert_eq!(outputs.keys().collect::<Vec<_>>(), vec![""]);
        assert_eq!(
            service.get_parsed_outputs(outputs),
            json!({ "name": "Ann" })
        );
    }

    #[test]
    fn test_labeled_or_multiple_outputs_stay_a_mapping() {
        let service = service();

        let request = vec![Parameter::output(1).with_label("customer")];
        let set = set_with_output(
            1,
            ParameterType::MemPointer,
            ParameterValue::MemPointer(b"42".to_vec()),
        );
        let outputs = service.get_output_parameters(&request, &set).unwrap();
        assert_eq!(service.get_parsed_outputs(outputs), json!({ "customer": 42 }));

        let request = vec![
            Parameter::output(1).with_type(ParameterType::Integer),
            Parameter::output(2).with_label("Bad Label").with_type(ParameterType::String),
        ];
        let mut set = ParameterService::new(ChecksumService::new()).generate_parameter_set(&request);
        set.set_output(1, ParameterValue::Integer(5)).unwrap();
        set.set_output(2, ParameterValue::Text("five".to_string()))
            .unwrap();

        let outputs = service.get_output_parameters(&request, &set).unwrap();
        assert_eq!(
            service.get_parsed_outputs(outputs),
            json!({ "1": 5, "2": "five" })
        );
    }
}
