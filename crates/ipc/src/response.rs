use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One preloaded processor, as reported by `Info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadedProcessor {
  /// Digest of the parameter bindings the processor was preloaded with.
  pub fingerprint: String,
  /// Workers holding warm state for this processor.
  pub workers: usize,
  /// Warm state is shared across the workers.
  pub shared: bool,
}

/// Worker utilisation snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
  /// Per-processor busy worker counts.
  pub busy: BTreeMap<String, usize>,
  /// Jobs served since startup.
  pub jobs_served: u64,
}

/// Result of a job offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobOutcome {
  /// The job ran to completion; outputs are staged in the caller's staging
  /// directory.
  Done,
  /// Every worker for this processor is busy; the caller should fall back.
  Busy,
  /// The request fingerprint does not match the preloaded bindings.
  ConfigMismatch { expected: String },
  /// The processor is not preloaded at all.
  NotPreloaded,
  /// The job ran and failed.
  Failed { message: String },
}

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "body")]
pub enum Response {
  Pong,
  Info(BTreeMap<String, PreloadedProcessor>),
  Status(StatusReport),
  /// Acknowledges `Stop`; the socket disappears shortly after.
  Stopping,
  Job(JobOutcome),
  /// Protocol-level failure (malformed request).
  Error(String),
}
