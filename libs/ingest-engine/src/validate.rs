use ingest_api::error::PluginError;
use ingest_api::processor::RecordProcessor;
use ingest_api::record::Record;
use serde_json::Value;

/// Accepts JSON objects that carry every required dotted path.
#[derive(Debug, Clone, Default)]
pub struct JsonValidator {
    required: Vec<Vec<String>>,
}

impl JsonValidator {
    pub fn new(required_fields: &[String]) -> Self {
        Self {
            required: required_fields
                .iter()
                .map(|f| f.split('.').map(str::to_string).collect())
                .collect(),
        }
    }

    fn check(&self, record: &Record) -> Result<(), PluginError> {
        let value: Value = serde_json::from_slice(&record.payload)
            .map_err(|e| PluginError::validation(format!("topic '{}': invalid JSON: {e}", record.topic)))?;
        if !value.is_object() {
            return Err(PluginError::validation(format!("topic '{}': payload is not an object", record.topic)));
        }
        for path in &self.required {
            let found = path.iter().try_fold(&value, |v, key| v.get(key.as_str()));
            if found.is_none_or(Value::is_null) {
                return Err(PluginError::validation(format!(
                    "topic '{}': missing field '{}'",
                    record.topic,
                    path.join(".")
                )));
            }
        }
        Ok(())
    }
}

impl RecordProcessor for JsonValidator {
    fn name(&self) -> &str {
        "json-validator"
    }

    fn process(&self, records: &[Record]) -> Result<(), PluginError> {
        records.iter().try_for_each(|r| self.check(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &str) -> Record {
        Record::new("t", payload.as_bytes().to_vec(), "t", 0)
    }

    #[test]
    fn required_paths_are_enforced() {
        let v = JsonValidator::new(&["id".to_string(), "properties.data_id".to_string()]);
        assert!(v.process(&[record(r#"{"id":"a","properties":{"data_id":"x"}}"#)]).is_ok());

        let missing = v.process(&[record(r#"{"id":"a","properties":{}}"#)]).unwrap_err();
        assert!(missing.message.contains("properties.data_id"), "{missing}");
        assert!(v.process(&[record(r#"{"id":null,"properties":{"data_id":1}}"#)]).is_err());
    }

    #[test]
    fn non_objects_fail() {
        let v = JsonValidator::default();
        assert!(v.process(&[record("{}")]).is_ok());
        assert!(v.process(&[record("[]")]).is_err());
        assert!(v.process(&[record("{")]).is_err());
    }
}
