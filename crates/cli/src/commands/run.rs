//! Execution commands: run, install/uninstall, run-rule, create-file and
//! build-models.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::model::ProcessorKind;
use weft_core::pipeline::Pipeline;
use weft_core::schedule::{RemoteDispatcher, RunReport, RunnerOptions};
use weft_preload::PreloadClient;

pub struct RunOptions {
  pub jobs: Option<usize>,
  pub socket: Option<PathBuf>,
  pub force_preloader: bool,
  pub use_registry_key: bool,
}

/// `weft run [TARGETS...]`
pub async fn cmd_run(targets: Vec<String>, options: RunOptions) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;

  let targets = if targets.is_empty() {
    let defaults = pipeline.default_targets();
    if defaults.is_empty() {
      bail!("nothing to do: no default exports configured (set 'export.default' or name targets)");
    }
    defaults
  } else {
    resolve_targets(&pipeline, &targets)?
  };

  let remote = match &options.socket {
    Some(socket) => Some(Arc::new(
      PreloadClient::connect(socket)
        .await
        .context("could not connect to the preloader")?,
    ) as Arc<dyn RemoteDispatcher>),
    None => None,
  };

  execute(&pipeline, &targets, &options, remote).await
}

/// `weft install` / `weft uninstall`
pub async fn cmd_install(targets: Vec<String>, jobs: Option<usize>, uninstall: bool) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;

  let targets = if targets.is_empty() {
    pipeline.rules.install_targets(&pipeline.config, uninstall)?
  } else {
    pipeline.rule_targets(&targets)?
  };
  if targets.is_empty() {
    let key = if uninstall { "uninstall" } else { "install" };
    bail!("nothing to do: no {key}ers configured (set the '{key}' config key or name targets)");
  }

  let options = RunOptions {
    jobs,
    socket: None,
    force_preloader: false,
    use_registry_key: true,
  };
  execute(&pipeline, &targets, &options, None).await
}

/// `weft run-rule TARGET...`
pub async fn cmd_run_rule(targets: Vec<String>) -> Result<()> {
  if targets.is_empty() {
    bail!("run-rule needs at least one rule name");
  }
  let pipeline = super::prepare_pipeline()?;
  let targets = pipeline.rule_targets(&targets)?;
  let options = RunOptions {
    jobs: None,
    socket: None,
    force_preloader: false,
    use_registry_key: true,
  };
  execute(&pipeline, &targets, &options, None).await
}

/// `weft create-file FILE...`: produce concrete work/export files.
pub async fn cmd_create_file(files: Vec<String>) -> Result<()> {
  if files.is_empty() {
    bail!("create-file needs at least one file path");
  }
  let pipeline = super::prepare_pipeline()?;
  let options = RunOptions {
    jobs: None,
    socket: None,
    force_preloader: false,
    use_registry_key: true,
  };
  execute(&pipeline, &files, &options, None).await
}

/// `weft build-models [--all] [--language LANG]`
pub async fn cmd_build_models(all: bool, language: Option<String>) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;

  let mut targets = Vec::new();
  for rule in pipeline.rules.rules() {
    if rule.kind != ProcessorKind::Modelbuilder || !rule.active {
      continue;
    }
    if let Some(language) = &language
      && !rule.processor.info.language.is_empty()
      && !rule.processor.info.language.contains(language)
    {
      continue;
    }
    // Without --all, only build models some active rule actually reads
    if !all {
      let needed = pipeline.rules.rules().any(|consumer| {
        consumer.active
          && consumer.kind != ProcessorKind::Modelbuilder
          && consumer.inputs.iter().any(|i| rule.outputs.contains(i))
      });
      if !needed {
        continue;
      }
    }
    targets.extend(pipeline.rules.rule_targets(rule, &[]));
  }

  if targets.is_empty() {
    println!("no models to build");
    return Ok(());
  }

  let options = RunOptions {
    jobs: None,
    socket: None,
    force_preloader: false,
    use_registry_key: true,
  };
  execute(&pipeline, &targets, &options, None).await
}

/// Turn CLI targets into concrete paths: rule names expand to their
/// outputs, anything else is taken as a file path.
fn resolve_targets(pipeline: &Pipeline, targets: &[String]) -> Result<Vec<String>> {
  let mut resolved = Vec::new();
  for target in targets {
    if pipeline.rules.get(target).is_some() {
      resolved.extend(pipeline.rule_targets(std::slice::from_ref(target))?);
    } else {
      resolved.push(target.clone());
    }
  }
  Ok(resolved)
}

async fn execute(
  pipeline: &Pipeline,
  targets: &[String],
  options: &RunOptions,
  remote: Option<Arc<dyn RemoteDispatcher>>,
) -> Result<()> {
  let runner_options = RunnerOptions {
    jobs: options.jobs.unwrap_or_else(default_jobs),
    force_preloader: options.force_preloader,
    use_registry_key: options.use_registry_key,
  };

  // Ctrl-C drains the run: no new jobs start, in-flight jobs get a grace
  // window, partial outputs are removed
  let cancel = CancellationToken::new();
  let cancel_for_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupt received, draining");
      cancel_for_signal.cancel();
    }
  });

  let report = pipeline.run(targets, runner_options, remote, cancel).await?;
  print_summary(&report);

  if report.is_success() {
    Ok(())
  } else {
    bail!("{} rule(s) failed", report.failed.len());
  }
}

fn print_summary(report: &RunReport) {
  info!("{}", report.summary());
  if !report.failed.is_empty() {
    eprintln!("failed rules:");
    for (job, reason) in &report.failed {
      eprintln!("  {job}: {reason}");
    }
  }
}

fn default_jobs() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
