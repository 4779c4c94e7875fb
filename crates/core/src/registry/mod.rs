//! Processor registry.
//!
//! Discovery walks a list of [`ModuleSet`]s (built-in modules, plus any
//! plugin modules the embedder registers), validates every processor
//! descriptor, merges declared config keys into the config store and indexes
//! processors by their global `<module>:<function>` identifier. Discovery is
//! pure with respect to configuration: no pipeline work happens here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::ConfigStore;
use crate::exec::Handler;
use crate::model::{check_language, ConfigKeySpec, ParamRole, ProcessorInfo, ProcessorKind, Reference};
use crate::{Error, Result};

/// A discovered module: metadata plus its processors and their bodies.
pub struct ModuleSet {
  pub name: String,
  pub description: String,
  /// Module-wide language restriction; processors may narrow it further.
  pub language: Vec<String>,
  /// Module-level config declarations (beyond per-processor ones).
  pub config: Vec<ConfigKeySpec>,
  pub processors: Vec<(ProcessorInfo, Arc<dyn Handler>)>,
}

/// A registered processor: read-only descriptor plus its body.
pub struct ProcessorEntry {
  pub info: ProcessorInfo,
  pub handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for ProcessorEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProcessorEntry").field("info", &self.info).finish_non_exhaustive()
  }
}

/// Module metadata kept for listings.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
  pub name: String,
  pub description: String,
  pub language: Vec<String>,
}

/// The frozen result of processor discovery.
#[derive(Debug)]
pub struct Registry {
  modules: BTreeMap<String, ModuleInfo>,
  processors: BTreeMap<String, Arc<ProcessorEntry>>,
  /// Class name -> candidate annotation targets, declared via `cls=` tags by
  /// processors active for the corpus language.
  class_candidates: BTreeMap<String, Vec<String>>,
  /// All languages any processor declares support for.
  languages: BTreeSet<String>,
  /// Config keys holding annotation lists (preset expansion applies there).
  annotation_sources: BTreeSet<String>,
}

impl Registry {
  /// Run discovery over a set of modules, updating the config store with
  /// declared keys, defaults, usage records and `import`/`export`
  /// inheritance.
  pub fn discover(modules: Vec<ModuleSet>, config: &mut ConfigStore) -> Result<Self> {
    let mut registry = Registry {
      modules: BTreeMap::new(),
      processors: BTreeMap::new(),
      class_candidates: BTreeMap::new(),
      languages: BTreeSet::new(),
      annotation_sources: BTreeSet::from(["export.annotations".to_string()]),
    };

    let corpus_lang = config.language().to_string();
    let corpus_variety = config.variety().map(str::to_string);

    for module in modules {
      registry.add_module(module, config, &corpus_lang, corpus_variety.as_deref())?;
    }

    registry.check_exporter_orders()?;
    config.validate_usage()?;

    debug!(
      modules = registry.modules.len(),
      processors = registry.processors.len(),
      "discovery complete"
    );
    Ok(registry)
  }

  fn add_module(
    &mut self,
    module: ModuleSet,
    config: &mut ConfigStore,
    corpus_lang: &str,
    corpus_variety: Option<&str>,
  ) -> Result<()> {
    if self.modules.contains_key(&module.name) {
      return Err(Error::invalid_processor(&module.name, "module registered twice"));
    }
    if module.description.is_empty() {
      warn!(module = %module.name, "module is missing a description");
    }
    for lang in &module.language {
      self.languages.insert(lang.clone());
    }

    for spec in &module.config {
      declare_key(config, spec, &module.name, &module.name)?;
    }

    let mut has_importer = false;
    let mut has_exporter = false;

    for (mut info, handler) in module.processors {
      // Processors inherit the module language unless they narrow it
      if info.language.is_empty() {
        info.language = module.language.clone();
      }
      for lang in &info.language {
        self.languages.insert(lang.clone());
      }

      let id = info.id();
      if self.processors.contains_key(&id) {
        return Err(Error::invalid_processor(&id, "duplicate processor identifier"));
      }
      if info.module != module.name {
        return Err(Error::invalid_processor(&id, format!("registered under module '{}'", module.name)));
      }

      validate_processor(&info)?;
      has_importer |= info.kind == ProcessorKind::Importer;
      has_exporter |= info.kind == ProcessorKind::Exporter;

      for spec in &info.config {
        declare_key(config, spec, &info.module, &id)?;
      }

      let active = check_language(corpus_lang, &info.language, corpus_variety);

      for param in &info.params {
        match &param.role {
          ParamRole::Config { key, default } => {
            config.add_usage(key, &id);
            if let Some(default) = default {
              config.set_default(key, default.clone())?;
            }
          }
          ParamRole::ExportAnnotations { config_key, .. } | ParamRole::SourceAnnotations { config_key } => {
            config.add_usage(config_key, &id);
            self.annotation_sources.insert(config_key.clone());
          }
          ParamRole::Output { reference, cls: Some(cls), .. } if active => {
            if let Some(target) = class_target(cls, reference) {
              let candidates = self.class_candidates.entry(class_name(cls).to_string()).or_default();
              if !candidates.contains(&target) {
                candidates.push(target);
              }
            } else {
              warn!(processor = %id, class = %cls, "malformed class tag");
            }
          }
          _ => {}
        }
      }

      // The chosen importer's text annotation seeds classes.text
      if info.kind == ProcessorKind::Importer
        && config.get_str("import.importer") == Some(id.as_str())
        && let Some(text_annotation) = &info.text_annotation
        && config.get("classes.text").is_none()
      {
        let text = Value::String(text_annotation.as_str().to_string());
        config.set_default("import.text_annotation", text)?;
        handle_text_annotation(config)?;
      }

      self.processors.insert(id, Arc::new(ProcessorEntry { info, handler }));
    }

    // Importer/exporter modules inherit the import/export sections
    if has_importer {
      config.inherit_section("import", &module.name)?;
    }
    if has_exporter {
      config.inherit_section("export", &module.name)?;
    }

    self.modules.insert(
      module.name.clone(),
      ModuleInfo {
        name: module.name,
        description: module.description,
        language: module.language,
      },
    );
    Ok(())
  }

  /// An exporter declaring `order` must actually have a conflict peer:
  /// another processor declaring an identical output set.
  fn check_exporter_orders(&self) -> Result<()> {
    let output_sets: Vec<(String, BTreeSet<String>)> = self
      .processors
      .values()
      .map(|p| (p.info.id(), declared_output_set(&p.info)))
      .collect();

    for entry in self.processors.values() {
      let info = &entry.info;
      if info.kind != ProcessorKind::Exporter || info.order.is_none() {
        continue;
      }
      let own = declared_output_set(info);
      if own.is_empty() {
        continue;
      }
      let id = info.id();
      let has_peer = output_sets.iter().any(|(other, set)| other != &id && set == &own);
      if !has_peer {
        return Err(Error::invalid_processor(
          id,
          "declares 'order' but no other processor produces the same output",
        ));
      }
    }
    Ok(())
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  pub fn get(&self, id: &str) -> Option<&Arc<ProcessorEntry>> {
    self.processors.get(id)
  }

  pub fn processors(&self) -> impl Iterator<Item = &Arc<ProcessorEntry>> {
    self.processors.values()
  }

  pub fn of_kind(&self, kind: ProcessorKind) -> impl Iterator<Item = &Arc<ProcessorEntry>> {
    self.processors.values().filter(move |p| p.info.kind == kind)
  }

  pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
    self.modules.values()
  }

  pub fn languages(&self) -> impl Iterator<Item = &String> {
    self.languages.iter()
  }

  pub fn class_candidates(&self) -> &BTreeMap<String, Vec<String>> {
    &self.class_candidates
  }

  pub fn annotation_sources(&self) -> &BTreeSet<String> {
    &self.annotation_sources
  }

  /// Digest over every descriptor; folded into content keys so processor
  /// upgrades invalidate previous runs.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    for (id, entry) in &self.processors {
      hasher.update(id.as_bytes());
      if let Ok(encoded) = serde_json::to_vec(&entry.info) {
        hasher.update(&encoded);
      }
    }
    format!("{:x}", hasher.finalize())
  }
}

// ============================================================================
// Validation helpers
// ============================================================================

fn declare_key(config: &mut ConfigStore, spec: &ConfigKeySpec, module: &str, declared_by: &str) -> Result<()> {
  if !spec.name.starts_with(&format!("{module}.")) {
    return Err(Error::invalid_processor(
      declared_by,
      format!("config key '{}' does not include the module name as prefix", spec.name),
    ));
  }
  if spec.description.is_empty() {
    return Err(Error::invalid_processor(
      declared_by,
      format!("config key '{}' is missing a description", spec.name),
    ));
  }
  config.declare(spec.clone(), declared_by)
}

fn validate_processor(info: &ProcessorInfo) -> Result<()> {
  let id = info.id();

  if info.description.trim().is_empty() {
    return Err(Error::invalid_processor(&id, "missing description"));
  }
  if info.kind == ProcessorKind::Importer && info.file_extension.is_none() {
    return Err(Error::invalid_processor(&id, "importer declares no file extension"));
  }

  let mut has_marker = false;
  let param_names: BTreeSet<&str> = info.params.iter().map(|p| p.name.as_str()).collect();

  for param in &info.params {
    match &param.role {
      ParamRole::Output { reference, .. } => {
        reference
          .validate()
          .map_err(|e| Error::invalid_processor(&id, format!("bad output reference: {e}")))?;
        check_module_prefix(&id, &info.module, reference)?;
      }
      ParamRole::Marker { reference } => {
        has_marker = true;
        reference
          .validate()
          .map_err(|e| Error::invalid_processor(&id, format!("bad marker reference: {e}")))?;
      }
      ParamRole::ModelOutput { name } => {
        let top = name.as_str().split('/').next().unwrap_or_default();
        if !top.starts_with(&info.module) {
          return Err(Error::invalid_processor(
            &id,
            format!("model output '{name}' does not use the module name as subdirectory"),
          ));
        }
      }
      ParamRole::Export { path } => {
        let Some((dir, _)) = path.split_once('/') else {
          return Err(Error::invalid_processor(&id, format!("export path '{path}' has no subdirectory")));
        };
        if dir != info.module && !dir.starts_with(&format!("{}.", info.module)) {
          return Err(Error::invalid_processor(
            &id,
            format!("export subdirectory '{dir}' does not include the module name as prefix"),
          ));
        }
      }
      _ => {}
    }
  }

  if matches!(info.kind, ProcessorKind::Installer | ProcessorKind::Uninstaller) && !has_marker {
    return Err(Error::invalid_processor(&id, "installers and uninstallers must declare a marker output"));
  }

  if let Some(preloader) = &info.preloader {
    if !param_names.contains(preloader.target.as_str()) {
      return Err(Error::invalid_processor(
        &id,
        format!("preloader target '{}' is not a parameter", preloader.target),
      ));
    }
    if preloader.params.iter().any(|p| p == &preloader.target) {
      return Err(Error::invalid_processor(&id, "cyclic preloader target binding"));
    }
    if let Some(unknown) = preloader.params.iter().find(|p| !param_names.contains(p.as_str())) {
      return Err(Error::invalid_processor(
        &id,
        format!("preloader parameter '{unknown}' is not a parameter"),
      ));
    }
  }

  Ok(())
}

/// Output names must carry their module as prefix: the span name for plain
/// outputs, the attribute for attribute outputs. Parts still containing
/// placeholders are checked once resolved.
fn check_module_prefix(id: &str, module: &str, reference: &Reference) -> Result<()> {
  let relevant = match reference.attribute() {
    Some(attr) => attr,
    None => reference.name(),
  };
  if relevant.contains(['<', '[', '{']) {
    return Ok(());
  }
  if !relevant.starts_with(&format!("{module}.")) {
    return Err(Error::invalid_processor(
      id,
      format!("output '{reference}' does not include the module name as prefix"),
    ));
  }
  Ok(())
}

/// Resolve a `cls=` tag to its annotation target, mirroring the tag forms:
/// `token` binds the span, `:word` binds the attribute, `token:word` binds
/// the full reference.
fn class_target(cls: &str, reference: &Reference) -> Option<String> {
  let (name, attr) = reference.split();
  if let Some(attr) = attr {
    if cls.starts_with(':') {
      Some(attr.to_string())
    } else if cls.contains(':') {
      Some(reference.as_str().to_string())
    } else {
      Some(name.to_string())
    }
  } else if !cls.contains(':') {
    Some(name.to_string())
  } else {
    None
  }
}

fn class_name(cls: &str) -> &str {
  cls.strip_prefix(':').unwrap_or(cls)
}

/// `classes.text` and `import.text_annotation` must agree; the latter seeds
/// the former.
pub fn handle_text_annotation(config: &mut ConfigStore) -> Result<()> {
  let text_ann = config.get_str("import.text_annotation").map(str::to_string);
  let class_text = config.get_str("classes.text").map(str::to_string);

  match (class_text, text_ann) {
    (Some(class_value), Some(import_value)) if class_value != import_value => Err(Error::ConfigInvalid(
      "'classes.text' and 'import.text_annotation' cannot have different values".into(),
    )),
    (None, Some(import_value)) => config.set_default("classes.text", Value::String(import_value)),
    _ => Ok(()),
  }
}

fn declared_output_set(info: &ProcessorInfo) -> BTreeSet<String> {
  let mut set: BTreeSet<String> = info.outputs().map(|(_, r)| r.as_str().to_string()).collect();
  for param in &info.params {
    if let ParamRole::Export { path } = &param.role {
      set.insert(path.clone());
    }
  }
  set
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::{annotator_info, noop_handler};

  fn annotator(module: &str, name: &str, output: &str, cls: Option<&str>) -> (ProcessorInfo, Arc<dyn Handler>) {
    (annotator_info(module, name, output, cls), noop_handler())
  }

  fn module(name: &str, processors: Vec<(ProcessorInfo, Arc<dyn Handler>)>) -> ModuleSet {
    ModuleSet {
      name: name.into(),
      description: format!("The {name} module."),
      language: vec![],
      config: vec![],
      processors,
    }
  }

  #[test]
  fn test_discovery_indexes_processors() {
    let mut config = ConfigStore::empty();
    let registry = Registry::discover(
      vec![module("segment", vec![annotator("segment", "tokenize", "segment.token", Some("token"))])],
      &mut config,
    )
    .unwrap();
    assert!(registry.get("segment:tokenize").is_some());
    assert_eq!(
      registry.class_candidates().get("token"),
      Some(&vec!["segment.token".to_string()])
    );
  }

  #[test]
  fn test_duplicate_identifier_fails() {
    let mut config = ConfigStore::empty();
    let result = Registry::discover(
      vec![module(
        "segment",
        vec![
          annotator("segment", "tokenize", "segment.token", None),
          annotator("segment", "tokenize", "segment.token2", None),
        ],
      )],
      &mut config,
    );
    assert!(matches!(result.unwrap_err(), Error::ProcessorInvalid { .. }));
  }

  #[test]
  fn test_missing_description_fails() {
    let mut config = ConfigStore::empty();
    let (mut info, h) = annotator("segment", "tokenize", "segment.token", None);
    info.description = String::new();
    let result = Registry::discover(vec![module("segment", vec![(info, h)])], &mut config);
    assert!(matches!(result.unwrap_err(), Error::ProcessorInvalid { .. }));
  }

  #[test]
  fn test_output_without_module_prefix_fails() {
    let mut config = ConfigStore::empty();
    let result = Registry::discover(
      vec![module("segment", vec![annotator("segment", "tokenize", "other.token", None)])],
      &mut config,
    );
    assert!(matches!(result.unwrap_err(), Error::ProcessorInvalid { .. }));
  }

  #[test]
  fn test_class_tag_on_attribute() {
    let mut config = ConfigStore::empty();
    let registry = Registry::discover(
      vec![module(
        "saldo",
        vec![annotator("saldo", "annotate", "<token>:saldo.baseform", Some(":baseform"))],
      )],
      &mut config,
    )
    .unwrap();
    assert_eq!(
      registry.class_candidates().get("baseform"),
      Some(&vec!["saldo.baseform".to_string()])
    );
  }

  #[test]
  fn test_inactive_language_excluded_from_classes() {
    let mut config = ConfigStore::from_yaml("metadata:\n  language: swe\n").unwrap();
    let (mut info, h) = annotator("fin_seg", "tokenize", "fin_seg.token", Some("token"));
    info.language = vec!["fin".into()];
    let registry = Registry::discover(vec![module("fin_seg", vec![(info, h)])], &mut config).unwrap();
    assert!(registry.class_candidates().get("token").is_none());
    // the processor itself stays registered (the compiler marks it inactive)
    assert!(registry.get("fin_seg:tokenize").is_some());
  }

  #[test]
  fn test_installer_without_marker_fails() {
    let mut config = ConfigStore::empty();
    let (mut info, h) = annotator("korp", "install", "korp.dump", None);
    info.kind = ProcessorKind::Installer;
    let result = Registry::discover(vec![module("korp", vec![(info, h)])], &mut config);
    assert!(matches!(result.unwrap_err(), Error::ProcessorInvalid { .. }));
  }

  #[test]
  fn test_cyclic_preloader_binding_fails() {
    use crate::model::{ParamSpec, PreloaderSpec};
    let mut config = ConfigStore::empty();
    let (mut info, h) = annotator("tagger", "tag", "tagger.pos", None);
    info.params.push(ParamSpec::new(
      "model",
      ParamRole::Config {
        key: "tagger.model".into(),
        default: None,
      },
    ));
    info.config = vec![ConfigKeySpec::new("tagger.model", "Model path")];
    info.preloader = Some(PreloaderSpec {
      params: vec!["model".into()],
      target: "model".into(),
      shared: true,
      cleanup: false,
    });
    let result = Registry::discover(vec![module("tagger", vec![(info, h)])], &mut config);
    assert!(matches!(result.unwrap_err(), Error::ProcessorInvalid { .. }));
  }

  #[test]
  fn test_registry_hash_changes_with_descriptors() {
    let mut config = ConfigStore::empty();
    let r1 = Registry::discover(
      vec![module("segment", vec![annotator("segment", "tokenize", "segment.token", None)])],
      &mut config,
    )
    .unwrap();
    let mut config2 = ConfigStore::empty();
    let r2 = Registry::discover(
      vec![module("segment", vec![annotator("segment", "tokenize", "segment.word", None)])],
      &mut config2,
    )
    .unwrap();
    assert_ne!(r1.hash(), r2.hash());
  }
}
