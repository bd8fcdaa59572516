use crate::{
    codec::{JobCodec, PayloadEnvelope},
    QueueError, QueueResult,
};

/// JSON codec for job payloads
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JobCodec for JsonCodec {
    fn encode(&self, envelope: &PayloadEnvelope) -> QueueResult<String> {
        Ok(serde_json::to_string(envelope)?)
    }

    fn decode(&self, raw: &str) -> QueueResult<PayloadEnvelope> {
        serde_json::from_str(raw).map_err(|e| QueueError::Deserialization(format!("malformed payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_missing_args_defaults_to_null() {
        let envelope = JsonCodec.decode(r#"{"job_type":"noop"}"#).unwrap();
        assert_eq!(envelope.job_type, "noop");
        assert!(envelope.args.is_null());
    }

    #[test]
    fn test_decode_garbage_is_deserialization_error() {
        let result = JsonCodec.decode("not json at all");
        assert!(matches!(result, Err(QueueError::Deserialization(_))));
    }

    #[test]
    fn test_encode_carries_type_and_args() {
        let raw = JsonCodec.encode(&PayloadEnvelope::new("resize", json!({"w": 10}))).unwrap();
        assert!(raw.contains("\"job_type\":\"resize\""));
        assert!(raw.contains("\"w\":10"));
    }
}
