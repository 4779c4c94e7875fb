//! Preloader control commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use weft_core::dirs::default_socket_path;
use weft_preload::{PreloadClient, PreloadServer, ServerConfig};

fn socket_or_default(socket: Option<PathBuf>) -> PathBuf {
  socket.unwrap_or_else(default_socket_path)
}

/// `weft preload start [--socket PATH] [--processes N]`
pub async fn cmd_preload_start(socket: Option<PathBuf>, processes: usize) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;
  let server = Arc::new(PreloadServer::prepare(
    &pipeline,
    ServerConfig {
      socket_path: socket_or_default(socket),
      processes,
    },
  )?);

  let cancel = tokio_util::sync::CancellationToken::new();
  let cancel_for_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("interrupt received, stopping preloader");
      cancel_for_signal.cancel();
    }
  });

  server.run(cancel).await?;
  Ok(())
}

/// `weft preload stop [--socket PATH]`
pub async fn cmd_preload_stop(socket: Option<PathBuf>) -> Result<()> {
  let socket = socket_or_default(socket);
  if PreloadClient::stop(&socket).await? {
    println!("preloader stopped");
  } else {
    println!("no preloader running on {}", socket.display());
  }
  Ok(())
}

/// `weft preload status [--socket PATH]`
pub async fn cmd_preload_status(socket: Option<PathBuf>) -> Result<()> {
  let socket = socket_or_default(socket);
  let status = PreloadClient::status(&socket)
    .await
    .context("could not reach the preloader")?;

  println!("jobs served: {}", status.jobs_served);
  for (processor, busy) in &status.busy {
    println!("{processor}: {busy} busy worker(s)");
  }
  Ok(())
}
