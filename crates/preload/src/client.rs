//! Scheduler-side preloader client.
//!
//! Implements the scheduler's `RemoteDispatcher` capability. The client
//! fetches the server's preload info once at connection time; jobs whose
//! processor is not preloaded, or whose fingerprint differs, are refused
//! locally without a round-trip.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use weft_core::Result;
use weft_core::exec::JobContext;
use weft_core::schedule::{RemoteDispatcher, RemoteOutcome};
use weft_ipc::{
  JobOutcome, JobRequest, PreloadedProcessor, ProtocolError, Request, Response, StatusReport, connect,
  connect_with_timeout, recv_message, send_message,
};

/// Per-request connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Backoff between retries when `force_preloader` blocks on a busy pool.
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct PreloadClient {
  socket_path: PathBuf,
  info: BTreeMap<String, PreloadedProcessor>,
}

impl PreloadClient {
  /// Connect and fetch the preload info.
  pub async fn connect(socket_path: &Path) -> Result<Self> {
    let mut socket = connect_with_timeout(socket_path, CONNECT_TIMEOUT).await?;
    send_message(&mut socket, &Request::Info).await?;
    let info = match recv_message::<Response>(&mut socket).await? {
      Response::Info(info) => info,
      other => {
        return Err(ProtocolError::Serde(format!("unexpected reply to Info: {other:?}")).into());
      }
    };
    debug!(processors = info.len(), "connected to preloader");
    Ok(Self {
      socket_path: socket_path.to_path_buf(),
      info,
    })
  }

  /// The processors the server holds warm, with their fingerprints.
  pub fn preloaded(&self) -> &BTreeMap<String, PreloadedProcessor> {
    &self.info
  }

  pub async fn ping(socket_path: &Path) -> Result<bool> {
    let mut socket = connect_with_timeout(socket_path, CONNECT_TIMEOUT).await?;
    send_message(&mut socket, &Request::Ping).await?;
    Ok(matches!(recv_message::<Response>(&mut socket).await?, Response::Pong))
  }

  pub async fn status(socket_path: &Path) -> Result<StatusReport> {
    let mut socket = connect_with_timeout(socket_path, CONNECT_TIMEOUT).await?;
    send_message(&mut socket, &Request::Status).await?;
    match recv_message::<Response>(&mut socket).await? {
      Response::Status(report) => Ok(report),
      other => Err(ProtocolError::Serde(format!("unexpected reply to Status: {other:?}")).into()),
    }
  }

  /// Ask a running preloader to drain and exit. Returns `false` when no
  /// server was listening.
  pub async fn stop(socket_path: &Path) -> Result<bool> {
    let mut socket = match connect(socket_path).await {
      Ok(socket) => socket,
      Err(ProtocolError::Connection(_)) => return Ok(false),
      Err(e) => return Err(e.into()),
    };
    send_message(&mut socket, &Request::Stop).await?;
    let _ = recv_message::<Response>(&mut socket).await;
    Ok(true)
  }

  async fn offer(&self, request: &Request) -> Result<JobOutcome> {
    let mut socket = connect_with_timeout(&self.socket_path, CONNECT_TIMEOUT).await?;
    send_message(&mut socket, request).await?;
    match recv_message::<Response>(&mut socket).await? {
      Response::Job(outcome) => Ok(outcome),
      Response::Error(message) => Err(ProtocolError::Serde(message).into()),
      other => Err(ProtocolError::Serde(format!("unexpected reply to Job: {other:?}")).into()),
    }
  }
}

#[async_trait::async_trait]
impl RemoteDispatcher for PreloadClient {
  async fn try_dispatch(
    &self,
    processor: &str,
    ctx: &JobContext,
    fingerprint: &str,
    force: bool,
  ) -> Result<RemoteOutcome> {
    // Refuse locally when possible; saves the round-trip
    let Some(preloaded) = self.info.get(processor) else {
      return Ok(RemoteOutcome::Refused(format!("'{processor}' is not preloaded")));
    };
    if preloaded.fingerprint != fingerprint {
      return Ok(RemoteOutcome::Refused(format!(
        "configuration mismatch for '{processor}': preloaded with different bindings"
      )));
    }

    let request = Request::Job(Box::new(JobRequest {
      processor: processor.to_string(),
      fingerprint: fingerprint.to_string(),
      context: ctx.clone(),
    }));

    loop {
      match self.offer(&request).await? {
        JobOutcome::Done => return Ok(RemoteOutcome::Completed),
        JobOutcome::Failed { message } => return Ok(RemoteOutcome::Failed(message)),
        JobOutcome::Busy if force => {
          // With force_preloader the caller blocks instead of falling back
          tokio::time::sleep(BUSY_RETRY_DELAY).await;
        }
        JobOutcome::Busy => return Ok(RemoteOutcome::Refused("all workers busy".into())),
        JobOutcome::ConfigMismatch { .. } => {
          return Ok(RemoteOutcome::Refused(format!("configuration mismatch for '{processor}'")));
        }
        JobOutcome::NotPreloaded => {
          return Ok(RemoteOutcome::Refused(format!("'{processor}' is not preloaded")));
        }
      }
    }
  }
}
