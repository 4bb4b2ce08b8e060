//! Output record serialization

use crate::messages::{CompletionError, CompletionOutput, Instance};
use batchgen_common::Result;
use serde_json::Value;

/// Builds one output record from an input row and its generation result
pub type Serializer =
    fn(&Instance, &[CompletionOutput], Option<CompletionError>) -> Result<Instance>;

/// Copy the input row and attach `outputs`, or `outputs: null` plus `completion_error`
pub fn default_serializer(
    input: &Instance,
    outputs: &[CompletionOutput],
    error: Option<CompletionError>,
) -> Result<Instance> {
    let mut record = input.clone();

    match error {
        Some(error) => {
            record.insert("outputs".to_string(), Value::Null);
            record.insert(
                "completion_error".to_string(),
                Value::String(error.as_str().to_string()),
            );
        }
        None => {
            record.insert("outputs".to_string(), serde_json::to_value(outputs)?);
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StopReason;
    use serde_json::json;

    fn row() -> Instance {
        serde_json::from_value(json!({"text": "hello", "id": "row-1"})).unwrap()
    }

    #[test]
    fn test_outputs_merged_into_a_copy() {
        let input = row();
        let outputs = vec![CompletionOutput {
            index: 0,
            text: "hi there".to_string(),
            token_ids: vec![5, 6],
            finish_reason: Some("stop".to_string()),
            stop_reason: Some(StopReason::Token(2)),
        }];

        let record = default_serializer(&input, &outputs, None).unwrap();

        assert_eq!(input, row());
        assert_eq!(
            Value::Object(record),
            json!({
                "text": "hello",
                "id": "row-1",
                "outputs": [{
                    "index": 0,
                    "text": "hi there",
                    "token_ids": [5, 6],
                    "finish_reason": "stop",
                    "stop_reason": 2,
                }],
            })
        );
    }

    #[test]
    fn test_error_sets_null_outputs() {
        let input = row();

        let record = default_serializer(&input, &[], Some(CompletionError::ContextTooLong)).unwrap();

        assert_eq!(record["outputs"], Value::Null);
        assert_eq!(record["completion_error"], json!("CONTEXT_TOO_LONG"));
        assert!(!input.contains_key("outputs"));
    }

    #[test]
    fn test_missing_finish_metadata_serializes_as_null() {
        let outputs = vec![CompletionOutput {
            index: 0,
            text: String::new(),
            token_ids: vec![],
            finish_reason: None,
            stop_reason: None,
        }];

        let record = default_serializer(&row(), &outputs, None).unwrap();

        assert_eq!(record["outputs"][0]["finish_reason"], Value::Null);
        assert_eq!(record["outputs"][0]["stop_reason"], Value::Null);
    }
}
