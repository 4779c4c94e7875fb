//! Engine error taxonomy.
//!
//! User-facing variants print a short message without a backtrace; internal
//! errors additionally get a detailed trace written to the corpus log
//! directory by the CLI front-end.

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Schema or value-range failure in a configuration file.
  #[error("invalid configuration: {0}")]
  ConfigInvalid(String),

  /// A required configuration key has no value anywhere in the hierarchy.
  #[error("missing configuration key '{0}'")]
  ConfigMissing(String),

  /// The `parent:` chain of a corpus config forms a cycle.
  #[error("configuration parent cycle involving '{0}'")]
  ConfigCycle(String),

  /// A referenced parent config file does not exist.
  #[error("parent configuration file not found: {0}")]
  ConfigNotFound(String),

  /// A processor was rejected at discovery time.
  #[error("invalid processor '{processor}': {reason}")]
  ProcessorInvalid { processor: String, reason: String },

  /// A class or configuration placeholder could not be expanded.
  #[error("unresolved reference '{reference}': {reason}")]
  ReferenceUnresolved { reference: String, reason: String },

  /// Multiple candidates for a class binding and no way to choose.
  #[error("ambiguous class <{class}>: candidates are {}", candidates.join(", "))]
  ClassAmbiguous { class: String, candidates: Vec<String> },

  /// Two rules with equal `order` produce the same output.
  #[error("conflicting producers for {output}: {} (set 'order' or pick one interactively)", rules.join(" and "))]
  ProducerConflict { output: String, rules: Vec<String> },

  /// Nothing produces a required file.
  #[error("no rule produces '{0}'")]
  NoProducer(String),

  /// The only producers of a required file are inactive for the corpus language.
  #[error("no rule for language '{language}' produces '{output}'")]
  LanguageUnsupported { language: String, output: String },

  /// An executed rule returned an error or produced no outputs.
  #[error("rule '{rule}' failed: {reason}")]
  RuleFailed { rule: String, reason: String },

  /// Preloader socket unavailable or a malformed message was received.
  #[error("preloader socket error: {0}")]
  Socket(String),

  /// Intentional, user-facing message raised by a processor.
  #[error("{0}")]
  User(String),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("YAML error: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

impl Error {
  /// Whether this error is expected user-level feedback (exit code 1) as
  /// opposed to an internal failure (exit code 2).
  pub fn is_user_error(&self) -> bool {
    !matches!(self, Error::Io(_) | Error::Json(_) | Error::Socket(_))
  }

  /// Shorthand for processor validation failures.
  pub fn invalid_processor(processor: impl Into<String>, reason: impl Into<String>) -> Self {
    Error::ProcessorInvalid {
      processor: processor.into(),
      reason: reason.into(),
    }
  }

  /// Shorthand for unresolved references.
  pub fn unresolved(reference: impl Into<String>, reason: impl Into<String>) -> Self {
    Error::ReferenceUnresolved {
      reference: reference.into(),
      reason: reason.into(),
    }
  }
}
