//! End-to-end engine assembly.
//!
//! Ties the subsystems together in their required order: load config, run
//! discovery, expand presets, validate, freeze, resolve, compile. The
//! result is a [`Pipeline`] value holding everything a run (or an
//! introspection command) needs; configuration and registry are frozen and
//! treated as read-only from here on.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compile::{Compiler, RuleSet};
use crate::config::presets::{PresetLibrary, apply_presets};
use crate::config::{ConfigStore, schema};
use crate::dirs::Paths;
use crate::registry::{ModuleSet, Registry};
use crate::resolve::{Arbiter, Decisions, Resolver};
use crate::schedule::runner::{RemoteDispatcher, RunReport, Runner, RunnerOptions};
use crate::schedule::JobGraph;
use crate::{Error, Result};

/// A fully prepared engine run.
pub struct Pipeline {
  pub paths: Paths,
  pub config: ConfigStore,
  pub registry: Registry,
  pub rules: RuleSet,
  pub source_files: Vec<String>,
  pub registry_hash: String,
  /// Class bindings established during resolution (for listings).
  pub classes: std::collections::BTreeMap<String, String>,
}

impl Pipeline {
  /// Prepare a pipeline for the corpus at `paths` with the given modules.
  /// Interactive choices go through `arbiter` and are persisted under the
  /// corpus directory.
  pub fn prepare(paths: Paths, modules: Vec<ModuleSet>, arbiter: &dyn Arbiter) -> Result<Self> {
    let mut config = ConfigStore::load(&paths)?;
    let registry = Registry::discover(modules, &mut config)?;

    // Presets expand before validation so expanded lists are checked
    if let Some(presets_dir) = paths.presets_dir() {
      let library = PresetLibrary::load(&presets_dir, config.language(), config.variety())?;
      apply_presets(&mut config, &library, registry.annotation_sources())?;
    }
    crate::registry::handle_text_annotation(&mut config)?;
    schema::validate(&config)?;
    config.freeze();

    let source_files = scan_source_files(&paths, &config, &registry)?;

    let decisions_file = paths.decisions_file();
    let mut decisions = Decisions::load(&decisions_file);
    let resolver = Resolver::new(&config, &registry, &mut decisions, arbiter)?;

    let compiler = Compiler {
      config: &config,
      registry: &registry,
      resolver: &resolver,
      paths: &paths,
      source_files: &source_files,
    };
    let rules = compiler.compile(&mut decisions, arbiter)?;
    decisions.save(&decisions_file)?;

    let classes = resolver.classes().clone();
    let registry_hash = registry.hash();
    drop(resolver);

    info!(
      rules = rules.rules().count(),
      files = source_files.len(),
      "pipeline prepared"
    );

    Ok(Self {
      paths,
      config,
      registry,
      rules,
      source_files,
      registry_hash,
      classes,
    })
  }

  /// Targets for a plain `run`: the default exports over all source files.
  pub fn default_targets(&self) -> Vec<String> {
    self.rules.default_export_targets(&self.config, &self.source_files)
  }

  /// Targets for named rules (`run TARGETS...`, `run-rule`).
  pub fn rule_targets(&self, names: &[String]) -> Result<Vec<String>> {
    let mut targets = Vec::new();
    for name in names {
      let rule = self
        .rules
        .get(name)
        .ok_or_else(|| Error::User(format!("unknown rule '{name}'")))?;
      let expanded = self.rules.rule_targets(rule, &self.source_files);
      if expanded.is_empty() {
        return Err(Error::User(format!("rule '{name}' has no concrete targets")));
      }
      targets.extend(expanded);
    }
    Ok(targets)
  }

  /// Build the job graph for a set of targets without executing it.
  pub fn plan(&self, targets: &[String]) -> Result<JobGraph> {
    JobGraph::build(&self.rules, &self.paths, targets, self.config.language())
  }

  /// Execute the given targets.
  pub async fn run(
    &self,
    targets: &[String],
    options: RunnerOptions,
    remote: Option<Arc<dyn RemoteDispatcher>>,
    cancel: CancellationToken,
  ) -> Result<RunReport> {
    let graph = self.plan(targets)?;
    debug!(targets = targets.len(), jobs = graph.nodes.len(), "starting run");
    let runner = Runner {
      paths: &self.paths,
      registry_hash: self.registry_hash.clone(),
      options,
      remote,
    };
    runner.execute(&graph, cancel).await
  }
}

/// Enumerate source files (extension stripped, subdirectories kept). When
/// the selected importer declares an extension, only matching files count.
fn scan_source_files(paths: &Paths, config: &ConfigStore, registry: &Registry) -> Result<Vec<String>> {
  let source_dir = paths.source_dir();
  if !source_dir.is_dir() {
    return Ok(Vec::new());
  }

  let extension = config
    .get_str("import.importer")
    .and_then(|id| registry.get(id))
    .and_then(|entry| entry.info.file_extension.clone());

  let mut files = Vec::new();
  let mut stack = vec![source_dir.clone()];
  while let Some(dir) = stack.pop() {
    for entry in std::fs::read_dir(&dir)? {
      let path = entry?.path();
      if path.is_dir() {
        stack.push(path);
        continue;
      }
      if let Some(wanted) = &extension
        && path.extension().and_then(|e| e.to_str()) != Some(wanted.as_str())
      {
        continue;
      }
      let stem = path.with_extension("");
      if let Ok(relative) = stem.strip_prefix(&source_dir) {
        files.push(relative.to_string_lossy().into_owned());
      }
    }
  }
  files.sort();
  Ok(files)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_scan_source_files_filters_by_extension() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("source");
    std::fs::create_dir_all(source.join("sub")).unwrap();
    std::fs::write(source.join("a.xml"), "<text/>").unwrap();
    std::fs::write(source.join("b.txt"), "text").unwrap();
    std::fs::write(source.join("sub/c.xml"), "<text/>").unwrap();

    let paths = Paths::with_data_dir(tmp.path(), tmp.path().join("data"));
    let mut config = ConfigStore::from_yaml("import:\n  importer: xml_import:parse\n").unwrap();

    let mut importer = crate::testutil::processor_info(
      "xml_import",
      "parse",
      crate::model::ProcessorKind::Importer,
      vec![],
    );
    importer.file_extension = Some("xml".into());
    let registry = Registry::discover(vec![crate::testutil::module_with("xml_import", vec![importer])], &mut config).unwrap();

    let files = scan_source_files(&paths, &config, &registry).unwrap();
    assert_eq!(files, vec!["a".to_string(), "sub/c".to_string()]);
  }
}
