pub mod json;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::QueueResult;

/// Tagged payload: a job type identifier plus its arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    /// Registered job type identifier
    pub job_type: String,

    /// Job arguments, decoded by the registered job type
    #[serde(default)]
    pub args: Value,
}

impl PayloadEnvelope {
    pub fn new(job_type: impl Into<String>, args: Value) -> Self {
        Self {
            job_type: job_type.into(),
            args,
        }
    }
}

/// Trait for job payload codecs
pub trait JobCodec: Send + Sync {
    /// Encode an envelope into the stored payload text
    fn encode(&self, envelope: &PayloadEnvelope) -> QueueResult<String>;

    /// Decode stored payload text into an envelope
    fn decode(&self, raw: &str) -> QueueResult<PayloadEnvelope>;
}

const JOB_TYPE_KEY: &str = "\"job_type\"";

/// Pull the job type out of raw payload text without decoding it.
///
/// Works on truncated or otherwise corrupt payloads as long as the
/// `"job_type": "<name>"` fragment survives.
pub fn sniff_job_type(raw: &str) -> Option<String> {
    let start = raw.find(JOB_TYPE_KEY)? + JOB_TYPE_KEY.len();
    let rest = raw[start..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    let name = &rest[..end];
    (!name.is_empty()).then(|| name.to_string())
}
