//! Job execution.
//!
//! One scheduler task owns the DAG state; jobs run on blocking worker
//! threads (or on the preloader, when one is attached and its fingerprint
//! matches) and report back over a completion channel. Dispatch respects
//! the global worker count, per-rule thread caps and job priorities.
//! Outputs are written to a staging directory and renamed into place after
//! success, so an aborted job leaves nothing behind.

use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::keys::{ContentKeyStore, content_key};
use super::{JobGraph, JobNode, preload_fingerprint};
use crate::dirs::Paths;
use crate::exec::JobContext;
use crate::{Error, Result};

/// Staging area inside the work directory.
const STAGING_DIR: &str = ".staging";

/// How long to wait for in-flight jobs after a cancellation signal.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RunnerOptions {
  /// Worker pool cardinality.
  pub jobs: usize,
  /// Fail instead of falling back locally when the preloader refuses.
  pub force_preloader: bool,
  /// Fold the registry hash into content keys.
  pub use_registry_key: bool,
}

impl Default for RunnerOptions {
  fn default() -> Self {
    Self {
      jobs: 4,
      force_preloader: false,
      use_registry_key: true,
    }
  }
}

/// Outcome of offering a job to the preloader.
pub enum RemoteOutcome {
  /// The preloader ran the job (outputs are staged).
  Completed,
  /// Refused (busy or fingerprint mismatch); the caller falls back.
  Refused(String),
  /// The preloader ran the job and it failed; no local retry.
  Failed(String),
}

/// Dispatch capability provided by the preloader client.
#[async_trait::async_trait]
pub trait RemoteDispatcher: Send + Sync {
  async fn try_dispatch(&self, processor: &str, ctx: &JobContext, fingerprint: &str, force: bool)
  -> Result<RemoteOutcome>;
}

/// Aggregate result of one run.
#[derive(Debug, Default)]
pub struct RunReport {
  pub executed: usize,
  pub fresh: usize,
  /// Failed jobs with their error messages.
  pub failed: Vec<(String, String)>,
  /// Jobs skipped because something upstream failed.
  pub tainted: usize,
}

impl RunReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }

  /// One-line summary for the final log message.
  pub fn summary(&self) -> String {
    format!(
      "{} executed, {} up to date, {} failed, {} skipped downstream",
      self.executed,
      self.fresh,
      self.failed.len(),
      self.tainted
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum JobState {
  Pending,
  Running,
  Done,
  Fresh,
  Failed,
  Tainted,
}

/// Priority-queue entry; higher rule priority first, then insertion order.
#[derive(PartialEq, Eq)]
struct Ready {
  priority: i32,
  index: usize,
}

impl Ord for Ready {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then(other.index.cmp(&self.index))
  }
}

impl PartialOrd for Ready {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

pub struct Runner<'a> {
  pub paths: &'a Paths,
  /// Registry digest folded into content keys (unless disabled).
  pub registry_hash: String,
  pub options: RunnerOptions,
  pub remote: Option<Arc<dyn RemoteDispatcher>>,
}

impl Runner<'_> {
  /// Execute the graph to completion (or until cancelled).
  pub async fn execute(&self, graph: &JobGraph, cancel: CancellationToken) -> Result<RunReport> {
    let work_dir = self.paths.work_dir();
    std::fs::create_dir_all(&work_dir)?;
    let mut key_store = ContentKeyStore::load(&work_dir);

    let (mut indegree, dependents) = graph.adjacency();
    let mut states = vec![JobState::Pending; graph.nodes.len()];
    let mut ready: BinaryHeap<Ready> = BinaryHeap::new();
    let mut rule_running: HashMap<String, usize> = HashMap::new();
    let mut running = 0usize;
    let mut report = RunReport::default();

    let (tx, mut rx) = mpsc::channel::<(usize, Result<()>)>(64);

    for (index, degree) in indegree.iter().enumerate() {
      if *degree == 0 {
        ready.push(Ready {
          priority: graph.nodes[index].rule.priority,
          index,
        });
      }
    }

    loop {
      if !cancel.is_cancelled() {
        self.dispatch(
          graph,
          &mut ready,
          &mut states,
          &mut rule_running,
          &mut running,
          &mut indegree,
          &dependents,
          &mut key_store,
          &mut report,
          &tx,
        );
      }

      if running == 0 {
        break;
      }

      let completion = if cancel.is_cancelled() {
        match tokio::time::timeout(CANCEL_GRACE, rx.recv()).await {
          Ok(completion) => completion,
          Err(_) => {
            warn!("grace window elapsed; abandoning {} in-flight job(s)", running);
            break;
          }
        }
      } else {
        rx.recv().await
      };
      let Some((index, result)) = completion else { break };

      running -= 1;
      let rule_id = graph.nodes[index].rule.id.clone();
      *rule_running.entry(rule_id).or_insert(1) -= 1;

      match result {
        Ok(()) if cancel.is_cancelled() => {
          // Finished during drain: outputs were published, but dependents
          // are not released
          states[index] = JobState::Done;
          report.executed += 1;
          self.record_key(graph, index, &mut key_store);
        }
        Ok(()) => {
          states[index] = JobState::Done;
          report.executed += 1;
          self.record_key(graph, index, &mut key_store);
          release_dependents(graph, index, &mut indegree, &dependents, &states, &mut ready);
        }
        Err(e) => {
          warn!(job = %graph.nodes[index].id, error = %e, "job failed");
          states[index] = JobState::Failed;
          key_store.forget(&graph.nodes[index].id);
          report.failed.push((graph.nodes[index].id.clone(), e.to_string()));
          taint_downstream(index, &dependents, &mut states, &mut report);
        }
      }
    }

    // Anything still pending at drain time counts as skipped
    if cancel.is_cancelled() {
      report.tainted += states.iter().filter(|s| **s == JobState::Pending).count();
      let _ = std::fs::remove_dir_all(work_dir.join(STAGING_DIR));
    }

    key_store.save()?;
    info!("{}", report.summary());
    Ok(report)
  }

  /// Start every dispatchable ready job.
  #[allow(clippy::too_many_arguments)]
  fn dispatch(
    &self,
    graph: &JobGraph,
    ready: &mut BinaryHeap<Ready>,
    states: &mut [JobState],
    rule_running: &mut HashMap<String, usize>,
    running: &mut usize,
    indegree: &mut [usize],
    dependents: &[Vec<usize>],
    key_store: &mut ContentKeyStore,
    report: &mut RunReport,
    tx: &mpsc::Sender<(usize, Result<()>)>,
  ) {
    let mut capped: Vec<Ready> = Vec::new();

    while *running < self.options.jobs {
      let Some(entry) = ready.pop() else { break };
      let index = entry.index;
      if states[index] != JobState::Pending {
        continue;
      }
      let node = &graph.nodes[index];

      // Per-rule thread caps
      let in_flight = rule_running.get(&node.rule.id).copied().unwrap_or(0);
      if node.rule.max_threads.is_some_and(|cap| in_flight >= cap) {
        capped.push(entry);
        continue;
      }

      // Freshness: unchanged key + existing, up-to-date outputs
      if self.is_fresh(node, key_store) {
        debug!(job = %node.id, "up to date");
        states[index] = JobState::Fresh;
        report.fresh += 1;
        release_dependents(graph, index, indegree, dependents, states, ready);
        continue;
      }

      states[index] = JobState::Running;
      *running += 1;
      *rule_running.entry(node.rule.id.clone()).or_insert(0) += 1;

      let node = node.clone();
      let tx = tx.clone();
      let paths = self.paths.clone();
      let remote = self.remote.clone();
      let force = self.options.force_preloader;
      tokio::spawn(async move {
        let result = run_job(&paths, &node, remote, force).await;
        let _ = tx.send((index, result)).await;
      });
    }

    for entry in capped {
      ready.push(entry);
    }
  }

  fn is_fresh(&self, node: &JobNode, key_store: &ContentKeyStore) -> bool {
    let Some(stored) = key_store.get(&node.id) else { return false };
    if node.outputs.is_empty() {
      return false;
    }

    let inputs: Vec<PathBuf> = node.inputs.iter().map(|i| JobNode::absolute(self.paths, i)).collect();
    let registry_hash = self.options.use_registry_key.then_some(self.registry_hash.as_str());
    if stored != content_key(&node.rule, &node.params, &inputs, registry_hash) {
      return false;
    }

    let newest_input = inputs
      .iter()
      .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
      .max();
    for output in &node.outputs {
      let path = JobNode::absolute(self.paths, output);
      let Ok(modified) = std::fs::metadata(&path).and_then(|m| m.modified()) else {
        return false;
      };
      if newest_input.is_some_and(|newest| modified < newest) {
        return false;
      }
    }
    true
  }

  fn record_key(&self, graph: &JobGraph, index: usize, key_store: &mut ContentKeyStore) {
    let node = &graph.nodes[index];
    let inputs: Vec<PathBuf> = node.inputs.iter().map(|i| JobNode::absolute(self.paths, i)).collect();
    let registry_hash = self.options.use_registry_key.then_some(self.registry_hash.as_str());
    key_store.record(&node.id, content_key(&node.rule, &node.params, &inputs, registry_hash));
  }
}

fn release_dependents(
  graph: &JobGraph,
  index: usize,
  indegree: &mut [usize],
  dependents: &[Vec<usize>],
  states: &[JobState],
  ready: &mut BinaryHeap<Ready>,
) {
  for &dependent in &dependents[index] {
    indegree[dependent] -= 1;
    if indegree[dependent] == 0 && states[dependent] == JobState::Pending {
      ready.push(Ready {
        priority: graph.nodes[dependent].rule.priority,
        index: dependent,
      });
    }
  }
}

/// Mark everything downstream of a failed job as tainted.
fn taint_downstream(failed: usize, dependents: &[Vec<usize>], states: &mut [JobState], report: &mut RunReport) {
  let mut queue = vec![failed];
  while let Some(index) = queue.pop() {
    for &dependent in &dependents[index] {
      if states[dependent] == JobState::Pending {
        states[dependent] = JobState::Tainted;
        report.tainted += 1;
        queue.push(dependent);
      }
    }
  }
}

// ============================================================================
// Single-job execution
// ============================================================================

/// Run one job: stage, execute (preloaded or locally), publish, verify.
async fn run_job(
  paths: &Paths,
  node: &JobNode,
  remote: Option<Arc<dyn RemoteDispatcher>>,
  force_preloader: bool,
) -> Result<()> {
  let work_dir = paths.work_dir();
  let staging = work_dir.join(STAGING_DIR).join(sanitize(&node.id));
  let _ = std::fs::remove_dir_all(&staging);
  std::fs::create_dir_all(staging.join("work"))?;

  let ctx = JobContext {
    rule: node.rule.id.clone(),
    file: node.file().map(str::to_string),
    params: node.params.clone(),
    work_dir: staging.join("work"),
    input_dir: work_dir.clone(),
    export_dir: staging.join("export"),
    export_input_dir: paths.export_dir(),
    source_dir: paths.source_dir(),
    models_dir: paths.models_dir(),
  };

  let result = execute_job(&ctx, node, remote, force_preloader).await;

  match result {
    Ok(()) => {
      publish(&staging.join("work"), &work_dir)?;
      if staging.join("export").is_dir() {
        publish(&staging.join("export"), &paths.export_dir())?;
      }
      let _ = std::fs::remove_dir_all(&staging);
      verify_outputs(paths, node)
    }
    Err(e) => {
      let _ = std::fs::remove_dir_all(&staging);
      Err(e)
    }
  }
}

async fn execute_job(
  ctx: &JobContext,
  node: &JobNode,
  remote: Option<Arc<dyn RemoteDispatcher>>,
  force_preloader: bool,
) -> Result<()> {
  if let Some(remote) = remote
    && let Some(fingerprint) = preload_fingerprint(&node.rule, &node.params)
  {
    let processor = node.rule.processor.info.id();
    match remote.try_dispatch(&processor, ctx, &fingerprint, force_preloader).await {
      Ok(RemoteOutcome::Completed) => return Ok(()),
      Ok(RemoteOutcome::Failed(message)) => {
        return Err(Error::RuleFailed {
          rule: node.rule.id.clone(),
          reason: message,
        });
      }
      Ok(RemoteOutcome::Refused(reason)) if force_preloader => {
        return Err(Error::Socket(format!("preloader refused '{}': {reason}", node.id)));
      }
      Ok(RemoteOutcome::Refused(reason)) => {
        debug!(job = %node.id, %reason, "preloader refused, running locally");
      }
      Err(e) if force_preloader => return Err(e),
      Err(e) => {
        warn!(job = %node.id, error = %e, "preloader unavailable, running locally");
      }
    }
  }

  let handler = Arc::clone(&node.rule.processor.handler);
  let ctx = ctx.clone();
  tokio::task::spawn_blocking(move || handler.execute(&ctx))
    .await
    .map_err(|e| Error::RuleFailed {
      rule: node.rule.id.clone(),
      reason: format!("worker panicked: {e}"),
    })?
}

/// Move every staged file into its final location. Renames within the same
/// filesystem make the publish atomic per file.
fn publish(staging: &Path, target_root: &Path) -> Result<()> {
  if !staging.is_dir() {
    return Ok(());
  }
  let mut stack = vec![staging.to_path_buf()];
  while let Some(dir) = stack.pop() {
    for entry in std::fs::read_dir(&dir)? {
      let entry = entry?;
      let path = entry.path();
      if path.is_dir() {
        stack.push(path);
        continue;
      }
      let Ok(relative) = path.strip_prefix(staging) else { continue };
      let target = target_root.join(relative);
      if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::rename(&path, &target)?;
    }
  }
  Ok(())
}

/// A rule that succeeds but produces none of its declared outputs failed.
fn verify_outputs(paths: &Paths, node: &JobNode) -> Result<()> {
  if node.rule.is_abstract {
    return Ok(());
  }
  for output in &node.outputs {
    let path = JobNode::absolute(paths, output);
    if !path.exists() {
      return Err(Error::RuleFailed {
        rule: node.rule.id.clone(),
        reason: format!("declared output '{output}' was not produced"),
      });
    }
  }
  Ok(())
}

fn sanitize(job_id: &str) -> String {
  let mut cleaned: String = job_id
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
    .collect();
  // Short digest avoids collisions between sanitised names
  let mut hasher = Sha256::new();
  hasher.update(job_id.as_bytes());
  let digest = format!("{:x}", hasher.finalize());
  cleaned.push('-');
  cleaned.push_str(&digest[..8]);
  cleaned
}
