//! Result Assembler: maps an [`ExecutionOutcome`] into the caller-facing
//! [`ResponseEnvelope`].

use crate::analyzer::Violation;
use crate::outcome::{ExecutionOutcome, ExecutionStatus, TableSnapshot};
use serde::{Deserialize, Serialize};

/// Error category reported to the caller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationRejected,
    RuntimeError,
    Timeout,
    CapabilityDenied,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<Violation>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub stdout: String,
    pub tables: Vec<TableSnapshot>,
    /// PNG images; base64 strings on the wire
    #[serde(with = "base64_images")]
    pub images: Vec<Vec<u8>>,
    pub error: Option<EnvelopeError>,
}

/// Build the response envelope for `outcome`
pub fn assemble(outcome: ExecutionOutcome) -> ResponseEnvelope {
    let ok = outcome.is_success();
    let kind = match outcome.status {
        ExecutionStatus::Success => None,
        ExecutionStatus::ValidationRejected => Some(ErrorKind::ValidationRejected),
        ExecutionStatus::RuntimeError => Some(ErrorKind::RuntimeError),
        ExecutionStatus::Timeout => Some(ErrorKind::Timeout),
        ExecutionStatus::CapabilityDenied => Some(ErrorKind::CapabilityDenied),
    };

    let error = kind.map(|kind| {
        let detail = outcome.error.unwrap_or_default();
        let violations = (kind == ErrorKind::ValidationRejected).then_some(detail.violations);
        EnvelopeError {
            kind,
            message: detail.message,
            violations,
        }
    });

    ResponseEnvelope {
        ok,
        stdout: outcome.stdout,
        tables: outcome.tables,
        images: outcome.images,
        error,
    }
}

impl ResponseEnvelope {
    /// Short plain-text rendering for tool responses
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if !self.stdout.trim().is_empty() {
            out.push_str("stdout:\n");
            out.push_str(self.stdout.trim_end());
            out.push('\n');
        }
        if let Some(error) = &self.error {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("error ({:?}):\n", error.kind));
            out.push_str(error.message.trim_end());
            out.push('\n');
        }
        if !self.tables.is_empty() || !self.images.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            let names: Vec<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
            out.push_str(&format!(
                "captured {} table(s) [{}] and {} image(s)\n",
                self.tables.len(),
                names.join(", "),
                self.images.len()
            ));
        }
        if out.is_empty() {
            out.push_str("ok");
        }
        out
    }
}

mod base64_images {
    use base64::engine::general_purpose::STANDARD as b64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(images: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(images.iter().map(|image| b64.encode(image)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| b64.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
