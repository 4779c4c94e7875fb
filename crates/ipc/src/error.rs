use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ProtocolError {
  #[error("connection error: {0}")]
  Connection(String),
  #[error("ser/de error: {0}")]
  Serde(String),
  #[error("I/O error: {0}")]
  Io(String),
  #[error("peer closed the connection")]
  Closed,
  #[error("connection timed out")]
  Timeout,
}

impl From<std::io::Error> for ProtocolError {
  fn from(err: std::io::Error) -> Self {
    ProtocolError::Io(err.to_string())
  }
}

impl From<serde_json::Error> for ProtocolError {
  fn from(err: serde_json::Error) -> Self {
    ProtocolError::Serde(err.to_string())
  }
}

impl From<ProtocolError> for weft_core::Error {
  fn from(err: ProtocolError) -> Self {
    weft_core::Error::Socket(err.to_string())
  }
}
