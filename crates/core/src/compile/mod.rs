//! Rule compilation.
//!
//! For each processor the compiler materialises zero or more rules: the
//! processor's parameters are resolved against the configuration and the
//! class table, inputs and outputs become corpus-relative path patterns
//! (with `{file}` left symbolic), and parameter bindings are fixed. Rules
//! whose references cannot be resolved because a configuration key is unset
//! are suppressed rather than failed: omission is how corpora disable
//! optional annotators.
//!
//! Rules producing identical output sets form conflict groups, ordered by
//! their `order` value; equal orders are an unresolvable conflict surfaced
//! to the user (and remembered once resolved interactively).

pub mod pattern;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_yaml::Value;
use tracing::{debug, warn};

pub use pattern::{PathPattern, WildcardBindings};

use crate::config::{ConfigStore, MAX_THREADS};
use crate::dirs::{EXPORT_DIR, Paths, SOURCE_DIR, WORK_DIR};
use crate::exec::{Bindings, ExportItem, ParamValue};
use crate::io::{SPAN_FILE, STRUCTURE_FILE, TEXT_FILE};
use crate::model::{ParamRole, ProcessorKind, Reference, WildcardSpec, check_language, parse_annotation_list};
use crate::registry::{ProcessorEntry, Registry};
use crate::resolve::{Arbiter, Decisions, Resolver};
use crate::{Error, Result};

/// A compiled, ready-to-schedule realisation of a processor.
#[derive(Debug)]
pub struct Rule {
  /// `<module>:<function>`, plus a suffix for custom-annotation rules.
  pub id: String,
  pub processor: Arc<ProcessorEntry>,
  pub kind: ProcessorKind,
  /// Corpus-relative input patterns (absolute for model files).
  pub inputs: Vec<PathPattern>,
  /// Corpus-relative output patterns.
  pub outputs: Vec<PathPattern>,
  pub params: Bindings,
  /// Parameters bound to the source-file name at job time.
  pub file_params: Vec<String>,
  /// The rule runs once per source file (patterns contain `{file}`).
  pub per_file: bool,
  pub order: Option<i32>,
  pub priority: i32,
  /// Config keys this rule is sensitive to.
  pub configs: BTreeSet<String>,
  /// Snapshot of those keys' values, folded into content keys.
  pub config_values: BTreeMap<String, String>,
  pub missing_binaries: BTreeSet<String>,
  pub wildcards: Vec<WildcardSpec>,
  pub preloader: Option<crate::model::PreloaderSpec>,
  /// Inactive rules (language mismatch) are excluded from scheduling.
  pub active: bool,
  pub max_threads: Option<usize>,
  /// Abstract exporters produce nothing; they only pull their inputs.
  pub is_abstract: bool,
  /// Position within this rule's conflict group, set by conflict
  /// resolution. Equal-`order` groups reflect the remembered or
  /// interactively chosen winner here, so producer lookup honours it.
  pub conflict_rank: usize,
}

impl Rule {
  /// Wildcards other than `{file}` occurring in outputs.
  pub fn output_wildcards(&self) -> BTreeSet<String> {
    self
      .outputs
      .iter()
      .flat_map(|o| o.placeholders())
      .filter(|p| p != "file")
      .collect()
  }

  pub fn has_wildcard_outputs(&self) -> bool {
    !self.output_wildcards().is_empty()
  }

  /// Key identifying this rule's conflict group.
  fn output_set_key(&self) -> String {
    let mut outputs: Vec<&str> = self.outputs.iter().map(PathPattern::as_str).collect();
    outputs.sort_unstable();
    outputs.join("\u{1f}")
  }
}

/// The compiled rule set for one engine run.
#[derive(Debug)]
pub struct RuleSet {
  rules: BTreeMap<String, Arc<Rule>>,
  /// Preferred-over-backoff pairs within conflict groups.
  orderings: Vec<(String, String)>,
}

impl RuleSet {
  pub fn get(&self, id: &str) -> Option<&Arc<Rule>> {
    self.rules.get(id)
  }

  pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
    self.rules.values()
  }

  pub fn orderings(&self) -> &[(String, String)] {
    &self.orderings
  }

  /// Active rules able to produce `target`, preferred producer first, with
  /// the wildcard bindings obtained by unification.
  pub fn find_producers(&self, target: &str) -> Vec<(Arc<Rule>, WildcardBindings)> {
    let mut found: Vec<(Arc<Rule>, WildcardBindings)> = Vec::new();
    for rule in self.rules.values() {
      if !rule.active || rule.is_abstract {
        continue;
      }
      for output in &rule.outputs {
        if let Some(bindings) = output.unify(target) {
          found.push((Arc::clone(rule), bindings));
          break;
        }
      }
    }
    // Order ascending (absent = lowest preference), then the conflict-group
    // position (carries equal-order decisions), then fewer wildcards (more
    // specific patterns win), then higher priority
    found.sort_by(|(a, ba), (b, bb)| {
      let order_a = a.order.unwrap_or(i32::MAX);
      let order_b = b.order.unwrap_or(i32::MAX);
      order_a
        .cmp(&order_b)
        .then(a.conflict_rank.cmp(&b.conflict_rank))
        .then(ba.len().cmp(&bb.len()))
        .then(b.priority.cmp(&a.priority))
        .then(a.id.cmp(&b.id))
    });
    found
  }

  /// Inactive rules that would produce `target` (language diagnostics).
  pub fn find_inactive_producers(&self, target: &str) -> Vec<Arc<Rule>> {
    self
      .rules
      .values()
      .filter(|r| !r.active)
      .filter(|r| r.outputs.iter().any(|o| o.unify(target).is_some()))
      .cloned()
      .collect()
  }

  /// Concrete output paths of the exporters named in `export.default` (or
  /// all non-abstract exporters when unset), expanded over `files`.
  pub fn default_export_targets(&self, config: &ConfigStore, files: &[String]) -> Vec<String> {
    let defaults = config.get_string_list("export.default");
    let mut targets = Vec::new();
    for rule in self.rules.values() {
      if rule.kind != ProcessorKind::Exporter || !rule.active {
        continue;
      }
      if !defaults.is_empty() && !defaults.contains(&rule.id) {
        continue;
      }
      targets.extend(self.rule_targets(rule, files));
    }
    targets
  }

  /// Concrete targets for one rule: wildcard-free outputs expanded over the
  /// source files (abstract exporters contribute their inputs instead).
  pub fn rule_targets(&self, rule: &Rule, files: &[String]) -> Vec<String> {
    let patterns = if rule.is_abstract { &rule.inputs } else { &rule.outputs };
    let mut targets = Vec::new();
    for pattern in patterns {
      if pattern.placeholders().iter().any(|p| p != "file") {
        continue;
      }
      if pattern.has_placeholder("file") {
        for file in files {
          let bindings = WildcardBindings::from([("file".to_string(), file.clone())]);
          if let Some(path) = pattern.to_path(&bindings) {
            targets.push(path.to_string_lossy().into_owned());
          }
        }
      } else {
        targets.push(pattern.as_str().to_string());
      }
    }
    targets
  }

  /// Marker targets for the installers/uninstallers named in config.
  pub fn install_targets(&self, config: &ConfigStore, uninstall: bool) -> Result<Vec<String>> {
    let (key, kind) = if uninstall {
      ("uninstall", ProcessorKind::Uninstaller)
    } else {
      ("install", ProcessorKind::Installer)
    };
    let mut targets = Vec::new();
    for id in config.get_string_list(key) {
      let rule = self
        .rules
        .get(&id)
        .filter(|r| r.kind == kind)
        .ok_or_else(|| Error::User(format!("unknown {} '{id}' in config", kind.as_str())))?;
      targets.extend(self.rule_targets(rule, &[]));
    }
    Ok(targets)
  }
}

// ============================================================================
// Compiler
// ============================================================================

/// Everything rule compilation needs; config and registry are frozen.
pub struct Compiler<'a> {
  pub config: &'a ConfigStore,
  pub registry: &'a Registry,
  pub resolver: &'a Resolver<'a>,
  pub paths: &'a Paths,
  pub source_files: &'a [String],
}

impl<'a> Compiler<'a> {
  /// Compile every processor (plus custom-annotation entries) into rules
  /// and resolve producer conflicts.
  pub fn compile(&self, decisions: &mut Decisions, arbiter: &dyn Arbiter) -> Result<RuleSet> {
    let mut rules: Vec<Rule> = Vec::new();

    for entry in self.registry.processors() {
      match self.build_rule(entry, self.resolver, None, None)? {
        Some(rule) => rules.push(rule),
        None => debug!(processor = %entry.info.id(), "rule suppressed"),
      }
    }

    self.build_custom_rules(&mut rules, decisions, arbiter)?;

    let orderings = resolve_conflicts(&mut rules, decisions, arbiter)?;

    let rules: BTreeMap<String, Arc<Rule>> = rules.into_iter().map(|r| (r.id.clone(), Arc::new(r))).collect();
    debug!(rules = rules.len(), orderings = orderings.len(), "rule compilation complete");
    Ok(RuleSet { rules, orderings })
  }

  /// Extra rules from the `custom_annotations` config section. Entries with
  /// `config:` re-run an annotator under overridden configuration and must
  /// carry a `suffix` to keep outputs distinct; entries with `params:`
  /// override parameter defaults directly.
  fn build_custom_rules(&self, rules: &mut Vec<Rule>, decisions: &mut Decisions, arbiter: &dyn Arbiter) -> Result<()> {
    let Some(Value::Sequence(entries)) = self.config.get("custom_annotations") else {
      return Ok(());
    };

    for entry in entries.clone() {
      let annotator = entry
        .get("annotator")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::ConfigInvalid("custom_annotations entry is missing 'annotator'".into()))?
        .to_string();
      let processor = self
        .registry
        .get(&annotator)
        .ok_or_else(|| Error::ConfigInvalid(format!("unknown annotator '{annotator}' in custom_annotations")))?;

      let suffix = entry.get("suffix").and_then(Value::as_str);

      if let Some(config_override) = entry.get("config") {
        let suffix = suffix.ok_or_else(|| {
          Error::ConfigInvalid(format!("custom annotation for '{annotator}' is missing the required key 'suffix'"))
        })?;
        let patched = self.config.with_overrides(config_override);
        let mut patched_decisions = decisions.clone();
        let resolver = Resolver::new(&patched, self.registry, &mut patched_decisions, arbiter)?;
        let compiler = Compiler {
          config: &patched,
          registry: self.registry,
          resolver: &resolver,
          paths: self.paths,
          source_files: self.source_files,
        };
        if let Some(rule) = compiler.build_rule(processor, &resolver, Some(suffix), None)? {
          rules.push(rule);
        }
        decisions.classes.extend(patched_decisions.classes);
      } else if let Some(Value::Mapping(params)) = entry.get("params") {
        let overrides: BTreeMap<String, Value> = params
          .iter()
          .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.clone())))
          .collect();
        let suffix = suffix.map(str::to_string).unwrap_or_else(|| {
          let existing = rules.iter().filter(|r| r.id.starts_with(&annotator)).count();
          format!("-{existing}")
        });
        if let Some(rule) = self.build_rule(processor, self.resolver, Some(&suffix), Some(&overrides))? {
          rules.push(rule);
        }
      } else {
        return Err(Error::ConfigInvalid(format!(
          "custom annotation for '{annotator}' needs either 'config' or 'params'"
        )));
      }
    }
    Ok(())
  }

  /// Build one rule for a processor. `Ok(None)` means suppressed (missing
  /// config, unbound class, or an importer that is not the selected one).
  fn build_rule(
    &self,
    entry: &Arc<ProcessorEntry>,
    resolver: &Resolver<'_>,
    suffix: Option<&str>,
    overrides: Option<&BTreeMap<String, Value>>,
  ) -> Result<Option<Rule>> {
    let info = &entry.info;
    let id = match suffix {
      Some(suffix) => format!("{}{suffix}", info.id()),
      None => info.id(),
    };

    let active = check_language(self.config.language(), &info.language, self.config.variety());

    let mut rule = Rule {
      id: id.clone(),
      processor: Arc::clone(entry),
      kind: info.kind,
      inputs: Vec::new(),
      outputs: Vec::new(),
      params: Bindings::new(),
      file_params: Vec::new(),
      per_file: false,
      order: info.order,
      priority: info.priority,
      configs: BTreeSet::new(),
      config_values: BTreeMap::new(),
      missing_binaries: BTreeSet::new(),
      wildcards: info.wildcards.clone(),
      preloader: info.preloader.clone(),
      active,
      max_threads: None,
      is_abstract: info.is_abstract,
      conflict_rank: 0,
    };

    if info.kind == ProcessorKind::Importer && !self.build_importer_io(info, resolver, &mut rule)? {
      return Ok(None);
    }

    for param in &info.params {
      let role = match overrides.and_then(|o| o.get(&param.name)) {
        Some(value) => override_role(&param.role, value)?,
        None => param.role.clone(),
      };
      if !self.bind_param(&id, &param.name, &role, param.optional, param.is_list, resolver, suffix, &mut rule)? {
        // Inactive rules are kept for diagnostics even when unresolvable
        if active {
          return Ok(None);
        }
      }
    }

    // Every output wildcard must be bound by some input
    let input_wildcards: BTreeSet<String> = rule
      .inputs
      .iter()
      .flat_map(|i| i.placeholders())
      .filter(|p| p != "file")
      .collect();
    for wildcard in rule.output_wildcards() {
      if !input_wildcards.contains(&wildcard) {
        return Err(Error::invalid_processor(
          &id,
          format!("output wildcard '{{{wildcard}}}' does not appear in any input"),
        ));
      }
    }

    rule.per_file = rule
      .inputs
      .iter()
      .chain(rule.outputs.iter())
      .any(|p| p.has_placeholder("file"));

    // Snapshot config sensitivity for content keys
    for key in rule.configs.clone() {
      if let Some(display) = self.config.get_display(&key) {
        rule.config_values.insert(key, display);
      }
    }
    if let Some(cap) = self.config.get_i64(&format!("{MAX_THREADS}.{}", info.id())) {
      rule.max_threads = usize::try_from(cap).ok().filter(|c| *c > 0);
    }

    Ok(Some(rule))
  }

  /// Importer source input and guaranteed outputs. Only the importer
  /// selected by `import.importer` produces anything.
  fn build_importer_io(&self, info: &crate::model::ProcessorInfo, resolver: &Resolver<'_>, rule: &mut Rule) -> Result<bool> {
    let extension = info.file_extension.as_deref().unwrap_or_default();
    rule.inputs.push(PathPattern::new(format!("{SOURCE_DIR}/{{file}}.{extension}")));

    if self.config.get_str("import.importer") != Some(info.id().as_str()) {
      // Unselected importers produce nothing and are suppressed
      return Ok(false);
    }

    rule.outputs.push(work_file_path(TEXT_FILE));
    rule.outputs.push(work_file_path(STRUCTURE_FILE));

    for output in &info.import_outputs {
      let expanded = resolver.expand(output.as_str())?;
      rule.configs.extend(expanded.used_configs.clone());
      if let Some(value) = expanded.value {
        let reference = Reference::new(value);
        push_unique(&mut rule.outputs, annotation_pattern(&reference, true));
        if reference.is_attribute() {
          push_unique(&mut rule.outputs, annotation_pattern(&reference.plain(), true));
        }
      }
    }

    if let Some(text_annotation) = self.config.get_str("import.text_annotation") {
      let expanded = resolver.expand(text_annotation)?;
      if let Some(value) = expanded.value {
        push_unique(&mut rule.outputs, annotation_pattern(&Reference::new(value), true));
      }
    }
    Ok(true)
  }

  /// Resolve one parameter into bindings and input/output patterns.
  /// Returns `false` when the rule must be suppressed.
  #[allow(clippy::too_many_arguments)]
  fn bind_param(
    &self,
    rule_id: &str,
    name: &str,
    role: &ParamRole,
    optional: bool,
    is_list: bool,
    resolver: &Resolver<'_>,
    suffix: Option<&str>,
    rule: &mut Rule,
  ) -> Result<bool> {
    match role {
      ParamRole::Config { key, default } => {
        rule.configs.insert(key.clone());
        let value = self
          .config
          .get(key)
          .cloned()
          .or_else(|| default.clone());
        match value {
          Some(value) => {
            rule.params.insert(name.to_string(), scalar_binding(value));
          }
          None if optional => {
            rule.params.insert(name.to_string(), ParamValue::None);
          }
          None => return Ok(false),
        }
      }

      ParamRole::Input { reference, all_files } => {
        let expanded = resolver.expand(reference.as_str())?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(value) = expanded.value else {
          if optional {
            rule.params.insert(name.to_string(), ParamValue::None);
            return Ok(true);
          }
          return Ok(false);
        };
        let resolved = Reference::new(value);
        let pattern = annotation_pattern(&resolved, true);
        if *all_files {
          for file in self.source_files {
            let bindings = WildcardBindings::from([("file".to_string(), file.clone())]);
            push_unique(&mut rule.inputs, pattern.bind(&bindings));
          }
        } else {
          push_unique(&mut rule.inputs, pattern);
        }
        let binding = if is_list {
          ParamValue::Annotations(vec![resolved])
        } else {
          ParamValue::Annotation(resolved)
        };
        rule.params.insert(name.to_string(), binding);
      }

      ParamRole::Output {
        reference,
        data,
        common,
        ..
      } => {
        let expanded = resolver.expand(reference.as_str())?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(mut value) = expanded.value else {
          if optional {
            rule.params.insert(name.to_string(), ParamValue::None);
            return Ok(true);
          }
          return Ok(false);
        };
        if let Some(suffix) = suffix {
          value.push_str(suffix);
        }
        let resolved = Reference::new(value);
        let pattern = output_pattern(&resolved, *data, *common);
        push_unique(&mut rule.outputs, pattern);
        rule.params.insert(name.to_string(), ParamValue::Annotation(resolved));
      }

      ParamRole::ExportAnnotations { config_key, all_files } => {
        rule.configs.insert(config_key.clone());
        let raw_entries = self.config.get_string_list(config_key);
        let parsed = parse_annotation_list(&raw_entries, None, true);
        let mut items = Vec::new();
        for (reference, export_name) in parsed {
          let expanded = resolver.expand(reference.as_str())?;
          rule.configs.extend(expanded.used_configs.clone());
          let Some(value) = expanded.value else { return Ok(false) };
          let resolved = Reference::new(value);
          let pattern = annotation_pattern(&resolved, true);
          if *all_files {
            for file in self.source_files {
              let bindings = WildcardBindings::from([("file".to_string(), file.clone())]);
              push_unique(&mut rule.inputs, pattern.bind(&bindings));
            }
          } else {
            push_unique(&mut rule.inputs, pattern.clone());
          }
          items.push(ExportItem {
            reference: resolved,
            export_name,
          });
        }
        rule.params.insert(name.to_string(), ParamValue::ExportItems(items));
      }

      ParamRole::SourceAnnotations { config_key } => {
        // The raw list is parsed at job time against the source file's
        // structure, where `not` exclusions and `...` are resolved. An
        // unset key means all source annotations; an empty list means none.
        rule.configs.insert(config_key.clone());
        let binding = match self.config.get(config_key) {
          Some(_) => ParamValue::Strings(self.config.get_string_list(config_key)),
          None => ParamValue::None,
        };
        push_unique(&mut rule.inputs, work_file_path(STRUCTURE_FILE));
        rule.params.insert(name.to_string(), binding);
      }

      ParamRole::Model { name: model_name } => {
        let expanded = resolver.expand(model_name.as_str())?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(value) = expanded.value else {
          if optional {
            rule.params.insert(name.to_string(), ParamValue::None);
            return Ok(true);
          }
          return Ok(false);
        };
        let Some(models_dir) = self.paths.models_dir() else {
          return Err(Error::User("no data directory configured; run 'weft setup' first".into()));
        };
        let path = models_dir.join(&value);
        rule.inputs.push(PathPattern::new(path.to_string_lossy().into_owned()));
        rule.params.insert(name.to_string(), ParamValue::Path(path));
      }

      ParamRole::ModelOutput { name: model_name } => {
        let expanded = resolver.expand(model_name.as_str())?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(value) = expanded.value else { return Ok(false) };
        let Some(models_dir) = self.paths.models_dir() else {
          return Err(Error::User("no data directory configured; run 'weft setup' first".into()));
        };
        let path = models_dir.join(&value);
        rule.outputs.push(PathPattern::new(path.to_string_lossy().into_owned()));
        rule.params.insert(name.to_string(), ParamValue::Path(path));
      }

      ParamRole::Binary { name: binary } => {
        let expanded = resolver.expand(binary)?;
        rule.configs.extend(expanded.used_configs.clone());
        let value = expanded.value.unwrap_or_else(|| binary.clone());
        match self.paths.find_binary(&value) {
          Some(path) => {
            rule.params.insert(name.to_string(), ParamValue::Path(path));
          }
          None => {
            warn!(rule = rule_id, binary = %value, "binary not found");
            rule.missing_binaries.insert(value.clone());
            rule.params.insert(name.to_string(), ParamValue::Str(value));
          }
        }
      }

      ParamRole::Source => {
        rule
          .params
          .insert(name.to_string(), ParamValue::Path(self.paths.source_dir()));
      }

      ParamRole::SourceFilename => {
        rule.file_params.push(name.to_string());
      }

      ParamRole::AllSourceFilenames => {
        rule
          .params
          .insert(name.to_string(), ParamValue::Files(self.source_files.to_vec()));
      }

      ParamRole::Text => {
        let pattern = work_file_path(TEXT_FILE);
        push_unique(&mut rule.inputs, pattern);
        rule.params.insert(name.to_string(), ParamValue::None);
      }

      ParamRole::Corpus => {
        // No corpus identifier suppresses the rule, like any missing config
        let Some(id) = self.config.get_str("metadata.id") else {
          return Ok(false);
        };
        rule.configs.insert("metadata.id".to_string());
        rule.params.insert(name.to_string(), ParamValue::Str(id.to_string()));
      }

      ParamRole::Language => {
        rule
          .params
          .insert(name.to_string(), ParamValue::Str(self.config.language().to_string()));
      }

      ParamRole::Export { path } => {
        let expanded = resolver.expand(path)?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(mut value) = expanded.value else { return Ok(false) };
        if let Some(suffix) = suffix {
          value.push_str(suffix);
        }
        rule.outputs.push(PathPattern::new(format!("{EXPORT_DIR}/{value}")));
        rule.params.insert(name.to_string(), ParamValue::Str(value));
      }

      ParamRole::ExportInput { path, all_files } => {
        let expanded = resolver.expand(path)?;
        rule.configs.extend(expanded.used_configs.clone());
        let Some(value) = expanded.value else { return Ok(false) };
        let pattern = PathPattern::new(format!("{EXPORT_DIR}/{value}"));
        if *all_files {
          for file in self.source_files {
            let bindings = WildcardBindings::from([("file".to_string(), file.clone())]);
            push_unique(&mut rule.inputs, pattern.bind(&bindings));
          }
        } else {
          push_unique(&mut rule.inputs, pattern);
        }
        rule.params.insert(name.to_string(), ParamValue::Str(value));
      }

      ParamRole::Marker { reference } => {
        let pattern = PathPattern::new(format!("{WORK_DIR}/{}", reference.as_str()));
        rule.outputs.push(pattern);
        rule
          .params
          .insert(name.to_string(), ParamValue::Annotation(reference.clone()));
      }

      ParamRole::MarkerOptional { reference } => {
        rule
          .params
          .insert(name.to_string(), ParamValue::Annotation(reference.clone()));
      }

      ParamRole::Scalar { value } => {
        rule.params.insert(name.to_string(), scalar_binding(value.clone()));
      }
    }
    Ok(true)
  }
}

// ============================================================================
// Conflict resolution
// ============================================================================

/// Group rules by normalised output set and order each group. Equal-order
/// pairs are settled by a remembered or interactive choice (or fail with
/// `ProducerConflict`); the final positions are written into each rule's
/// `conflict_rank` so producer lookup follows them. Returns the
/// preferred-over-backoff orderings for diagnostics.
fn resolve_conflicts(rules: &mut [Rule], decisions: &mut Decisions, arbiter: &dyn Arbiter) -> Result<Vec<(String, String)>> {
  let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
  for (index, rule) in rules.iter().enumerate() {
    // Inactive rules never take part in conflicts; rules without outputs
    // cannot conflict
    if rule.active && !rule.outputs.is_empty() {
      groups.entry(rule.output_set_key()).or_default().push(index);
    }
  }

  let mut orderings = Vec::new();
  for (key, members) in groups {
    if members.len() < 2 {
      continue;
    }
    let mut members = members;
    members.sort_by_key(|&i| (rules[i].order.unwrap_or(i32::MAX), rules[i].id.clone()));

    // Equal orders are unresolvable without user input; a resolved winner
    // moves ahead of the loser
    let mut position = 0;
    while position + 1 < members.len() {
      let (a, b) = (&rules[members[position]], &rules[members[position + 1]]);
      if a.order.is_some() && a.order == b.order {
        let output = a.outputs.first().map(|o| o.as_str().to_string()).unwrap_or_default();
        let candidates = vec![a.id.clone(), b.id.clone()];
        let chosen = decisions.orders.get(&key).cloned().or_else(|| {
          arbiter
            .choose(&format!("Several rules produce '{output}' with the same order"), &candidates)
            .map(|i| candidates[i].clone())
        });
        match chosen {
          Some(winner) if candidates.contains(&winner) => {
            decisions.orders.insert(key.clone(), winner.clone());
            if candidates[1] == winner {
              members.swap(position, position + 1);
            }
          }
          _ => {
            return Err(Error::ProducerConflict {
              output,
              rules: candidates,
            });
          }
        }
      }
      position += 1;
    }

    for (rank, &index) in members.iter().enumerate() {
      rules[index].conflict_rank = rank;
    }
    for pair in members.windows(2) {
      orderings.push((rules[pair[0]].id.clone(), rules[pair[1]].id.clone()));
    }
  }
  Ok(orderings)
}

// ============================================================================
// Path helpers
// ============================================================================

fn work_file_path(name: &str) -> PathPattern {
  PathPattern::new(format!("{WORK_DIR}/{{file}}/{name}"))
}

/// Work path for an annotation reference; `per_file` adds the `{file}`
/// segment.
fn annotation_pattern(reference: &Reference, per_file: bool) -> PathPattern {
  let tail = match reference.attribute() {
    Some(attr) => format!("{}/{attr}", reference.name()),
    None => format!("{}/{SPAN_FILE}", reference.name()),
  };
  if per_file {
    PathPattern::new(format!("{WORK_DIR}/{{file}}/{tail}"))
  } else {
    PathPattern::new(format!("{WORK_DIR}/{tail}"))
  }
}

fn output_pattern(reference: &Reference, data: bool, common: bool) -> PathPattern {
  if data {
    if common {
      PathPattern::new(format!("{WORK_DIR}/{}", reference.as_str()))
    } else {
      PathPattern::new(format!("{WORK_DIR}/{{file}}/{}", reference.as_str()))
    }
  } else {
    annotation_pattern(reference, !common)
  }
}

fn push_unique(patterns: &mut Vec<PathPattern>, pattern: PathPattern) {
  if !patterns.contains(&pattern) {
    patterns.push(pattern);
  }
}

fn scalar_binding(value: Value) -> ParamValue {
  match value {
    Value::String(s) => ParamValue::Str(s),
    other => ParamValue::Scalar(other),
  }
}

/// Replace a parameter's role default with an override from a custom rule.
fn override_role(role: &ParamRole, value: &Value) -> Result<ParamRole> {
  let as_str = || {
    value
      .as_str()
      .map(str::to_string)
      .ok_or_else(|| Error::ConfigInvalid("custom annotation parameter override must be a string".into()))
  };
  Ok(match role {
    ParamRole::Input { all_files, .. } => ParamRole::Input {
      reference: Reference::new(as_str()?),
      all_files: *all_files,
    },
    ParamRole::Output {
      cls,
      description,
      data,
      common,
      ..
    } => ParamRole::Output {
      reference: Reference::new(as_str()?),
      cls: cls.clone(),
      description: description.clone(),
      data: *data,
      common: *common,
    },
    // A custom value replaces the config lookup entirely
    ParamRole::Config { .. } | ParamRole::Scalar { .. } => ParamRole::Scalar { value: value.clone() },
    other => other.clone(),
  })
}

#[cfg(test)]
mod tests;
