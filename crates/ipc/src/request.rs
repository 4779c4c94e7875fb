use serde::{Deserialize, Serialize};
use weft_core::exec::JobContext;

/// A job offered to the preloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
  /// Processor identifier (`<module>:<function>`).
  pub processor: String,
  /// Digest of the preloader parameter bindings; must match the bindings
  /// the server preloaded with.
  pub fingerprint: String,
  /// Full job context; the server executes against the same corpus
  /// directories as the caller.
  pub context: JobContext,
}

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "body")]
pub enum Request {
  /// Liveness probe.
  Ping,
  /// Describe the preloaded processors and their fingerprints.
  Info,
  /// Worker utilisation snapshot.
  Status,
  /// Drain in-flight work and shut down.
  Stop,
  /// Execute one job.
  Job(Box<JobRequest>),
}
