use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::{
    codec::{json::JsonCodec, JobCodec, PayloadEnvelope},
    job::{Job, JobType},
    QueueError, QueueResult,
};

type Decoder = Arc<dyn Fn(Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

/// A payload turned back into an invocable job
pub struct DecodedJob {
    /// Job type identifier from the payload
    pub job_type: String,

    /// The invocable job
    pub job: Box<dyn Job>,
}

impl DecodedJob {
    /// Display name, falling back to the job type
    pub fn name(&self) -> String {
        self.job.display_name().unwrap_or_else(|| self.job_type.clone())
    }
}

impl std::fmt::Debug for DecodedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedJob").field("job_type", &self.job_type).finish()
    }
}

/// Registry mapping job type identifiers to decoders.
///
/// Decoding fails closed: an unknown identifier is a deserialization error,
/// never an attempt at open-ended construction.
pub struct JobRegistry {
    decoders: HashMap<String, Decoder>,
    codec: Arc<dyn JobCodec>,
}

impl JobRegistry {
    /// Create a new job registry using the JSON codec
    pub fn new() -> Self {
        Self::with_codec(Arc::new(JsonCodec))
    }

    /// Create a registry with a custom payload codec
    pub fn with_codec(codec: Arc<dyn JobCodec>) -> Self {
        Self {
            decoders: HashMap::new(),
            codec,
        }
    }

    /// Register a job type
    pub fn register<J: JobType>(&mut self) -> QueueResult<()> {
        if self.decoders.contains_key(J::JOB_TYPE) {
            return Err(QueueError::Internal(format!("Job type '{}' already registered", J::JOB_TYPE)));
        }

        let decoder: Decoder = Arc::new(|args| {
            let job: J = serde_json::from_value(args)?;
            Ok(Box::new(job) as Box<dyn Job>)
        });
        self.decoders.insert(J::JOB_TYPE.to_string(), decoder);
        Ok(())
    }

    /// Builder-style registration
    pub fn with<J: JobType>(mut self) -> QueueResult<Self> {
        self.register::<J>()?;
        Ok(self)
    }

    /// Check if a job type is registered
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.decoders.contains_key(job_type)
    }

    /// Get all registered job types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.decoders.keys().cloned().collect();
        types.sort();
        types
    }

    /// Encode a typed job into payload text
    pub fn encode<J: JobType>(&self, job: &J) -> QueueResult<String> {
        let args = serde_json::to_value(job)?;
        self.codec.encode(&PayloadEnvelope::new(J::JOB_TYPE, args))
    }

    /// Encode an already built envelope into payload text
    pub fn encode_envelope(&self, envelope: &PayloadEnvelope) -> QueueResult<String> {
        self.codec.encode(envelope)
    }

    /// Enqueue-time validation: the payload must name a registered job type
    /// whose arguments decode. Returns the job type; failures are `InvalidPayload`.
    pub fn validate(&self, raw: &str) -> QueueResult<String> {
        self.decode(raw).map(|decoded| decoded.job_type).map_err(|e| match e {
            QueueError::Deserialization(msg) => QueueError::InvalidPayload(msg),
            other => other,
        })
    }

    /// Rebuild the invocable job from payload text
    pub fn decode(&self, raw: &str) -> QueueResult<DecodedJob> {
        let envelope = self.codec.decode(raw)?;
        let decoder = self
            .decoders
            .get(&envelope.job_type)
            .ok_or_else(|| QueueError::Deserialization(format!("Unknown job type: {}", envelope.job_type)))?;

        let job = decoder(envelope.args).map_err(|e| {
            QueueError::Deserialization(format!("Invalid arguments for {}: {}", envelope.job_type, e))
        })?;

        Ok(DecodedJob {
            job_type: envelope.job_type,
            job,
        })
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
