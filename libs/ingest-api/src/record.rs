use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// A routed bus message, immutable once the router emits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    pub partition_key: String,
    /// Unix ms at which the router appended the record.
    pub enqueue_ms: i64,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        partition_key: impl Into<String>,
        enqueue_ms: i64,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            partition_key: partition_key.into(),
            enqueue_ms,
        }
    }
}

/// Which relational target a batch feeds. Carried on every queue message so
/// a single loader can serve all pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSource {
    Notifications,
    SurfaceObs,
    Cap,
}

impl BatchSource {
    pub const ALL: [BatchSource; 3] = [
        BatchSource::Notifications,
        BatchSource::SurfaceObs,
        BatchSource::Cap,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            BatchSource::Notifications => "notifications",
            BatchSource::SurfaceObs => "surface_observations",
            BatchSource::Cap => "cap_alerts",
        }
    }
}

impl std::fmt::Display for BatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            BatchSource::Notifications => "notifications",
            BatchSource::SurfaceObs => "surface_obs",
            BatchSource::Cap => "cap",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Size,
    Time,
}

/// A compacted run of records, written once as one storage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub pipeline: String,
    pub records: Vec<Record>,
    pub flush_reason: FlushReason,
    pub created_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct BatchHeader {
    pipeline: String,
    flush_reason: FlushReason,
    created_ms: i64,
    records: usize,
}

impl Batch {
    /// Encode as newline-delimited JSON: a header line, then one line per record.
    pub fn encode(&self) -> Result<Vec<u8>, PluginError> {
        let header = BatchHeader {
            pipeline: self.pipeline.clone(),
            flush_reason: self.flush_reason,
            created_ms: self.created_ms,
            records: self.records.len(),
        };
        let mut out = serde_json::to_vec(&header)?;
        out.push(b'\n');
        for record in &self.records {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PluginError> {
        let mut lines = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace));

        let header: BatchHeader = match lines.next() {
            Some(line) => serde_json::from_slice(line)
                .map_err(|e| PluginError::format(format!("batch header: {e}")))?,
            None => return Err(PluginError::format("empty batch object")),
        };

        let records = lines
            .map(serde_json::from_slice::<Record>)
            .collect::<Result<Vec<_>, _>>()?;

        if records.len() != header.records {
            return Err(PluginError::format(format!(
                "batch declares {} records, found {}",
                header.records,
                records.len()
            )));
        }

        Ok(Self {
            pipeline: header.pipeline,
            records,
            flush_reason: header.flush_reason,
            created_ms: header.created_ms,
        })
    }

    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload.len()).sum()
    }
}

mod payload_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Batch {
        Batch {
            pipeline: "notifications".into(),
            records: vec![
                Record::new("cache/a/b", br#"{"id":1}"#.to_vec(), "cache/a/b", 10),
                Record::new("cache/a/c", vec![0u8, 159, 146, 150], "k2", 11),
            ],
            flush_reason: FlushReason::Time,
            created_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn batch_survives_encoding_with_binary_payloads() {
        let batch = sample();
        let bytes = batch.encode().unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 3);
        assert_eq!(Batch::decode(&bytes).unwrap(), batch);
    }

    #[test]
    fn truncated_batch_is_format_error() {
        let bytes = sample().encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let truncated: String = text.lines().take(2).collect::<Vec<_>>().join("\n");
        let err = Batch::decode(truncated.as_bytes()).unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Format);
    }

    #[test]
    fn source_tags_are_snake_case() {
        let json = serde_json::to_string(&BatchSource::SurfaceObs).unwrap();
        assert_eq!(json, "\"surface_obs\"");
        assert_eq!(BatchSource::Cap.table(), "cap_alerts");
    }
}
