//! Preloader server.
//!
//! On start the server runs the preload hook of every processor listed in
//! the `preload` config section, then accepts connections on a Unix socket
//! and executes jobs against the warm state. Each processor gets a bounded
//! pool of workers; a request arriving while every worker is busy is
//! refused immediately so the caller can fall back to local execution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::exec::{Bindings, JobContext, WarmState};
use weft_core::pipeline::Pipeline;
use weft_core::schedule::preload_fingerprint;
use weft_core::{Error, Result};
use weft_ipc::{JobOutcome, PreloadedProcessor, Request, Response, StatusReport, frame, recv_message, send_message};

/// Server configuration.
pub struct ServerConfig {
  pub socket_path: PathBuf,
  /// Workers per preloaded processor.
  pub processes: usize,
}

/// One preloaded processor with its warm-state pool.
struct PreloadEntry {
  processor: String,
  handler: Arc<dyn weft_core::exec::Handler>,
  /// Bindings handed to the preload hook (and hashed into the fingerprint).
  preload_params: Bindings,
  fingerprint: String,
  shared: bool,
  run_cleanup: bool,
  /// Idle warm states. Shared-state processors keep a single entry that
  /// every worker locks in turn.
  idle: tokio::sync::Mutex<Vec<WarmState>>,
  /// Number of workers currently executing a job.
  busy: AtomicUsize,
  workers: usize,
}

impl PreloadEntry {
  fn try_claim(&self) -> bool {
    self
      .busy
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |busy| {
        (busy < self.workers).then_some(busy + 1)
      })
      .is_ok()
  }

  fn release(&self) {
    self.busy.fetch_sub(1, Ordering::SeqCst);
  }
}

/// The preloader server; bound to one corpus and one socket.
pub struct PreloadServer {
  config: ServerConfig,
  entries: BTreeMap<String, Arc<PreloadEntry>>,
  jobs_served: AtomicU64,
}

impl PreloadServer {
  /// Build the server from a prepared pipeline: resolve the `preload`
  /// config list against the compiled rules and run every preload hook.
  pub fn prepare(pipeline: &Pipeline, config: ServerConfig) -> Result<Self> {
    let preload_list = pipeline.config.get_string_list("preload");
    if preload_list.is_empty() {
      return Err(Error::User(
        "preloader config is missing; list processors to preload under the 'preload' config key".into(),
      ));
    }

    let mut entries = BTreeMap::new();
    for processor in preload_list {
      let rule = pipeline.rules.get(&processor).ok_or_else(|| {
        Error::User(format!(
          "unknown processor '{processor}' in preloader config; either it does not exist or it was suppressed"
        ))
      })?;
      let Some(spec) = rule.preloader.clone() else {
        return Err(Error::User(format!("processor '{processor}' does not support preloading")));
      };

      let preload_params: Bindings = rule
        .params
        .iter()
        .filter(|(name, _)| spec.params.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
      let fingerprint = preload_fingerprint(rule, &rule.params)
        .ok_or_else(|| Error::User(format!("processor '{processor}' has no preloader fingerprint")))?;

      let workers = config.processes.max(1);
      let handler = Arc::clone(&rule.processor.handler);

      // Shared state is loaded once; per-worker state once per worker
      info!(processor = %processor, workers, shared = spec.shared, "preloading");
      let mut idle = Vec::new();
      if spec.shared {
        idle.push(handler.preload(&preload_params)?);
      } else {
        for _ in 0..workers {
          idle.push(handler.preload(&preload_params)?);
        }
      }

      entries.insert(
        processor.clone(),
        Arc::new(PreloadEntry {
          processor,
          handler,
          preload_params,
          fingerprint,
          shared: spec.shared,
          run_cleanup: spec.cleanup,
          idle: tokio::sync::Mutex::new(idle),
          busy: AtomicUsize::new(0),
          workers: if spec.shared { 1 } else { workers },
        }),
      );
    }

    Ok(Self {
      config,
      entries,
      jobs_served: AtomicU64::new(0),
    })
  }

  /// Serve until `stop` is received or the token is cancelled. Removes the
  /// socket file on the way out.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
    if self.config.socket_path.exists() {
      return Err(Error::Socket(format!(
        "socket {} already exists; is another preloader running?",
        self.config.socket_path.display()
      )));
    }
    if let Some(parent) = self.config.socket_path.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(&self.config.socket_path)?;
    info!(
      "preloader ready on {}; run 'weft run --socket {}' to use it",
      self.config.socket_path.display(),
      self.config.socket_path.display()
    );

    let in_flight = Arc::new(AtomicUsize::new(0));

    loop {
      tokio::select! {
        biased;

        _ = cancel.cancelled() => {
          info!("preloader shutting down (cancelled)");
          break;
        }

        result = listener.accept() => {
          match result {
            Ok((stream, _)) => {
              let server = Arc::clone(&self);
              let cancel = cancel.clone();
              let in_flight = Arc::clone(&in_flight);
              tokio::spawn(async move {
                in_flight.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = server.handle_connection(stream, cancel).await {
                  debug!(error = %e, "connection ended with error");
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
              });
            }
            Err(e) => error!(error = %e, "accept error"),
          }
        }
      }
    }

    // Drain: give in-flight connections a moment to finish
    for _ in 0..100 {
      if in_flight.load(Ordering::SeqCst) == 0 {
        break;
      }
      tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    if self.config.socket_path.exists() {
      tokio::fs::remove_file(&self.config.socket_path).await?;
    }
    info!("preloader stopped");
    Ok(())
  }

  async fn handle_connection(&self, stream: UnixStream, cancel: CancellationToken) -> Result<()> {
    let mut socket = frame(stream);

    loop {
      let request: Request = match recv_message(&mut socket).await {
        Ok(request) => request,
        Err(weft_ipc::ProtocolError::Closed) => return Ok(()),
        Err(e) => {
          let _ = send_message(&mut socket, &Response::Error(e.to_string())).await;
          return Err(e.into());
        }
      };

      match request {
        Request::Ping => send_message(&mut socket, &Response::Pong).await?,

        Request::Info => {
          let info: BTreeMap<String, PreloadedProcessor> = self
            .entries
            .values()
            .map(|entry| {
              (
                entry.processor.clone(),
                PreloadedProcessor {
                  fingerprint: entry.fingerprint.clone(),
                  workers: entry.workers,
                  shared: entry.shared,
                },
              )
            })
            .collect();
          send_message(&mut socket, &Response::Info(info)).await?;
        }

        Request::Status => {
          let mut busy = BTreeMap::new();
          for entry in self.entries.values() {
            busy.insert(entry.processor.clone(), entry.busy.load(Ordering::SeqCst));
          }
          let report = StatusReport {
            busy,
            jobs_served: self.jobs_served.load(Ordering::SeqCst),
          };
          send_message(&mut socket, &Response::Status(report)).await?;
        }

        Request::Stop => {
          send_message(&mut socket, &Response::Stopping).await?;
          cancel.cancel();
          return Ok(());
        }

        Request::Job(job) => {
          let outcome = self.execute(&job.processor, &job.fingerprint, job.context).await;
          send_message(&mut socket, &Response::Job(outcome)).await?;
        }
      }
    }
  }

  /// Execute one job against a warm worker, or refuse.
  async fn execute(&self, processor: &str, fingerprint: &str, ctx: JobContext) -> JobOutcome {
    let Some(entry) = self.entries.get(processor) else {
      return JobOutcome::NotPreloaded;
    };
    if entry.fingerprint != fingerprint {
      return JobOutcome::ConfigMismatch {
        expected: entry.fingerprint.clone(),
      };
    }
    if !entry.try_claim() {
      return JobOutcome::Busy;
    }

    let result = self.run_on_worker(entry, ctx).await;
    entry.release();

    match result {
      Ok(()) => {
        self.jobs_served.fetch_add(1, Ordering::SeqCst);
        JobOutcome::Done
      }
      Err(e) => JobOutcome::Failed { message: e.to_string() },
    }
  }

  async fn run_on_worker(&self, entry: &Arc<PreloadEntry>, ctx: JobContext) -> Result<()> {
    // Claim an idle warm state; try_claim guarantees one is available
    let mut warm = {
      let mut idle = entry.idle.lock().await;
      match idle.pop() {
        Some(state) => state,
        None => {
          return Err(Error::Socket("no idle warm state despite free worker".into()));
        }
      }
    };

    let handler = Arc::clone(&entry.handler);
    let run_cleanup = entry.run_cleanup;
    let params = entry.preload_params.clone();
    let job = ctx.rule.clone();
    debug!(job = %job, "running preloaded job");

    let joined = tokio::task::spawn_blocking(move || {
      let result = handler.execute_preloaded(&ctx, &mut warm);
      // The cleanup hook may replace the warm state (e.g. restart a
      // backing subprocess) regardless of the job result
      if run_cleanup {
        match handler.cleanup(warm, &params) {
          Ok(next) => (result, Some(next)),
          Err(e) => {
            warn!(error = %e, "preloader cleanup failed");
            (result, None)
          }
        }
      } else {
        (result, Some(warm))
      }
    })
    .await;

    match joined {
      Ok((result, state)) => {
        if let Some(state) = state {
          entry.idle.lock().await.push(state);
        }
        result
      }
      Err(e) => Err(Error::RuleFailed {
        rule: job,
        reason: format!("preloader worker panicked: {e}"),
      }),
    }
  }
}
