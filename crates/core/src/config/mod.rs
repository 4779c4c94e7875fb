//! Configuration store.
//!
//! Configuration is a tree keyed by dotted paths, assembled from (highest
//! precedence first): the corpus config, its `parent:` chain, the data
//! directory's default config, and module-declared defaults. `import` and
//! `export` additionally act as inheritance roots: their keys flow into
//! every importer/exporter module's own section when not overridden.
//!
//! The store is mutable during discovery (modules register keys and
//! defaults) and frozen before rule compilation; the compiler and scheduler
//! treat it as a value.

pub mod presets;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::dirs::Paths;
use crate::model::ConfigKeySpec;
use crate::{Error, Result};

/// Reserved key introducing the parent chain.
pub const PARENT: &str = "parent";

/// Config section capping per-rule worker counts.
pub const MAX_THREADS: &str = "threads";

/// Core-declared configuration keys, available without any module.
fn core_keys() -> Vec<ConfigKeySpec> {
  use crate::model::DataType;
  vec![
    ConfigKeySpec::new("metadata.id", "Corpus identifier"),
    ConfigKeySpec::new("metadata.language", "Corpus language as ISO 639-3 code")
      .with_default(Value::String("__all__".into())),
    ConfigKeySpec::new("metadata.variety", "Optional language variety suffix"),
    ConfigKeySpec::new("classes", "Bindings from class names to annotation references").with_datatype(DataType::Map),
    ConfigKeySpec::new("custom_annotations", "Extra rule instantiations with parameter overrides")
      .with_datatype(DataType::List),
    ConfigKeySpec::new("install", "Default installers to run").with_datatype(DataType::List),
    ConfigKeySpec::new("uninstall", "Default uninstallers to run").with_datatype(DataType::List),
    ConfigKeySpec::new(PARENT, "Parent configuration file(s) to inherit from"),
    ConfigKeySpec::new(MAX_THREADS, "Per-processor worker caps").with_datatype(DataType::Map),
    ConfigKeySpec::new("preload", "Processors served by the preloader").with_datatype(DataType::List),
    ConfigKeySpec::new("import.importer", "Importer used for the source files"),
    ConfigKeySpec::new("import.text_annotation", "Annotation carrying the corpus text"),
    ConfigKeySpec::new("export.annotations", "Automatic annotations to include in exports")
      .with_datatype(DataType::List),
    ConfigKeySpec::new("export.default", "Exports produced by a plain `weft run`").with_datatype(DataType::List),
    ConfigKeySpec::new("export.source_annotations", "Source-markup annotations kept in exports")
      .with_datatype(DataType::List),
  ]
}

/// The merged configuration for one engine run.
#[derive(Debug, Clone)]
pub struct ConfigStore {
  values: Value,
  /// Declared keys, by dotted path.
  structure: BTreeMap<String, ConfigKeySpec>,
  /// For every config key, the rules reading it.
  usage: BTreeMap<String, BTreeSet<String>>,
  frozen: bool,
}

impl Default for ConfigStore {
  fn default() -> Self {
    Self::empty()
  }
}

impl ConfigStore {
  /// An empty store with only the core keys declared.
  pub fn empty() -> Self {
    let mut store = Self {
      values: Value::Mapping(Mapping::new()),
      structure: BTreeMap::new(),
      usage: BTreeMap::new(),
      frozen: false,
    };
    for spec in core_keys() {
      store.structure.insert(spec.name.clone(), spec);
    }
    store
  }

  /// Load the corpus config with its parent chain, merged over the data
  /// directory's default config.
  pub fn load(paths: &Paths) -> Result<Self> {
    let mut store = Self::empty();

    let corpus_config = paths.config_file();
    if corpus_config.is_file() {
      let mut seen = HashSet::new();
      let merged = load_with_parents(&corpus_config, &mut seen)?;
      store.values = merged;
    }

    if let Some(default_file) = paths.default_config_file()
      && default_file.is_file()
    {
      let default: Value = serde_yaml::from_str(&std::fs::read_to_string(&default_file)?)?;
      merge_missing(&mut store.values, &default);
      debug!("merged default config from {}", default_file.display());
    }

    // Root level must only hold sections (or the parent key) so dotted
    // lookups stay meaningful
    if let Value::Mapping(map) = &store.values {
      for (key, value) in map {
        let name = key.as_str().unwrap_or_default();
        if name != PARENT && !matches!(value, Value::Mapping(_) | Value::Sequence(_)) {
          return Err(Error::ConfigInvalid(format!(
            "top-level key '{name}' must be a section, not a scalar"
          )));
        }
      }
    }

    Ok(store)
  }

  /// Build a store from an in-memory YAML document (tests, `weft schema`).
  pub fn from_yaml(yaml: &str) -> Result<Self> {
    let mut store = Self::empty();
    store.values = serde_yaml::from_str(yaml)?;
    if matches!(store.values, Value::Null) {
      store.values = Value::Mapping(Mapping::new());
    }
    Ok(store)
  }

  // ==========================================================================
  // Lookup
  // ==========================================================================

  /// Dotted-path lookup. Inheritance from `import.*`/`export.*` is applied
  /// beforehand by [`ConfigStore::inherit_section`]; this is a plain walk.
  pub fn get(&self, key: &str) -> Option<&Value> {
    let mut current = &self.values;
    for part in key.split('.') {
      current = current.as_mapping()?.get(part)?;
    }
    if matches!(current, Value::Null) { None } else { Some(current) }
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.get(key).and_then(Value::as_str)
  }

  pub fn get_bool(&self, key: &str) -> Option<bool> {
    self.get(key).and_then(Value::as_bool)
  }

  pub fn get_i64(&self, key: &str) -> Option<i64> {
    self.get(key).and_then(Value::as_i64)
  }

  pub fn get_string_list(&self, key: &str) -> Vec<String> {
    match self.get(key) {
      Some(Value::Sequence(items)) => items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect(),
      Some(Value::String(s)) => vec![s.clone()],
      _ => Vec::new(),
    }
  }

  /// The string form of a value, as substituted into `[key]` placeholders.
  pub fn get_display(&self, key: &str) -> Option<String> {
    self.get(key).map(value_display)
  }

  /// Required lookup, failing with `ConfigMissing`.
  pub fn require_str(&self, key: &str) -> Result<&str> {
    self.get_str(key).ok_or_else(|| Error::ConfigMissing(key.to_string()))
  }

  pub fn language(&self) -> &str {
    self.get_str("metadata.language").unwrap_or("__all__")
  }

  pub fn variety(&self) -> Option<&str> {
    self.get_str("metadata.variety")
  }

  // ==========================================================================
  // Mutation (discovery phase only)
  // ==========================================================================

  pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
    self.ensure_mutable()?;
    set_dotted(&mut self.values, key, value, true);
    Ok(())
  }

  /// Set a value only when the key is unset (or explicitly null).
  pub fn set_default(&mut self, key: &str, value: Value) -> Result<()> {
    self.ensure_mutable()?;
    if self.get(key).is_none() {
      set_dotted(&mut self.values, key, value, false);
    }
    Ok(())
  }

  /// Declare a configuration key. Incompatible redeclarations across
  /// modules fail discovery.
  pub fn declare(&mut self, spec: ConfigKeySpec, declared_by: &str) -> Result<()> {
    self.ensure_mutable()?;
    if let Some(existing) = self.structure.get(&spec.name) {
      if existing != &spec {
        return Err(Error::invalid_processor(
          declared_by,
          format!("config key '{}' has already been declared with different constraints", spec.name),
        ));
      }
      return Ok(());
    }
    if let Some(default) = &spec.default {
      self.set_default(&spec.name, default.clone())?;
    }
    self.structure.insert(spec.name.clone(), spec);
    Ok(())
  }

  /// Let a module section inherit keys it declares from an inheritance root
  /// (`import` or `export`).
  pub fn inherit_section(&mut self, source: &str, target_module: &str) -> Result<()> {
    self.ensure_mutable()?;
    let Some(Value::Mapping(source_map)) = self.get(source).cloned() else {
      return Ok(());
    };
    for (key, value) in source_map {
      let Some(key) = key.as_str() else { continue };
      let target_key = format!("{target_module}.{key}");
      if self.structure.contains_key(&target_key) && self.get(&target_key).is_none() {
        set_dotted(&mut self.values, &target_key, value.clone(), false);
      }
    }
    Ok(())
  }

  /// A copy of this store with `overrides` merged on top, replacing
  /// existing values (custom-annotation rules run under patched config).
  pub fn with_overrides(&self, overrides: &Value) -> Self {
    let mut patched = self.clone();
    merge_replace(&mut patched.values, overrides);
    patched
  }

  /// Freeze the store; any further mutation is a programming error surfaced
  /// as `ConfigInvalid`.
  pub fn freeze(&mut self) {
    self.frozen = true;
  }

  pub fn is_frozen(&self) -> bool {
    self.frozen
  }

  fn ensure_mutable(&self) -> Result<()> {
    if self.frozen {
      return Err(Error::ConfigInvalid("configuration is frozen".into()));
    }
    Ok(())
  }

  // ==========================================================================
  // Usage tracking
  // ==========================================================================

  /// Record that `rule` reads `key`.
  pub fn add_usage(&mut self, key: &str, rule: &str) {
    self.usage.entry(key.to_string()).or_default().insert(rule.to_string());
  }

  pub fn usage_of(&self, key: &str) -> Vec<String> {
    self.usage.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
  }

  /// Every key referenced by some rule must be declared somewhere.
  pub fn validate_usage(&self) -> Result<()> {
    for (key, rules) in &self.usage {
      if !self.is_declared(key) {
        let rules: Vec<_> = rules.iter().cloned().collect();
        return Err(Error::ConfigInvalid(format!(
          "config key '{key}' used by {} is not declared by any module",
          rules.join(", ")
        )));
      }
    }
    Ok(())
  }

  pub fn is_declared(&self, key: &str) -> bool {
    // A declared map key covers its subkeys (e.g. `classes.token`)
    self.structure.contains_key(key)
      || self
        .structure
        .keys()
        .any(|declared| key.starts_with(declared.as_str()) && key.as_bytes().get(declared.len()) == Some(&b'.'))
  }

  pub fn declared_keys(&self) -> impl Iterator<Item = &ConfigKeySpec> {
    self.structure.values()
  }

  pub fn spec(&self, key: &str) -> Option<&ConfigKeySpec> {
    self.structure.get(key)
  }

  /// Raw merged values (used by `weft config` and the schema validator).
  pub fn values(&self) -> &Value {
    &self.values
  }
}

// ============================================================================
// YAML plumbing
// ============================================================================

fn load_with_parents(config_file: &Path, seen: &mut HashSet<PathBuf>) -> Result<Value> {
  let canonical = config_file
    .canonicalize()
    .map_err(|_| Error::ConfigNotFound(config_file.display().to_string()))?;
  if !seen.insert(canonical.clone()) {
    return Err(Error::ConfigCycle(config_file.display().to_string()));
  }

  let text = std::fs::read_to_string(&canonical).map_err(|_| Error::ConfigNotFound(canonical.display().to_string()))?;
  let mut config: Value = serde_yaml::from_str(&text)
    .map_err(|e| Error::ConfigInvalid(format!("could not parse {}: {e}", config_file.display())))?;
  if matches!(config, Value::Null) {
    config = Value::Mapping(Mapping::new());
  }

  let parents = match config.get(PARENT) {
    Some(Value::String(p)) => vec![p.clone()],
    Some(Value::Sequence(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
    _ => Vec::new(),
  };

  // Walk the chain depth-first; later parents override earlier ones, and the
  // child overrides them all
  let base_dir = canonical.parent().unwrap_or(Path::new("."));
  let mut combined = Value::Mapping(Mapping::new());
  for parent in parents.iter().rev() {
    let parent_value = load_with_parents(&base_dir.join(parent), seen)?;
    merge_missing(&mut combined, &parent_value);
  }
  merge_missing(&mut config, &combined);

  seen.remove(&canonical);
  Ok(config)
}

/// Recursively merge `src` into `dst`, replacing scalar values.
pub(crate) fn merge_replace(dst: &mut Value, src: &Value) {
  let (Value::Mapping(dst_map), Value::Mapping(src_map)) = (&mut *dst, src) else {
    *dst = src.clone();
    return;
  };
  for (key, value) in src_map {
    match dst_map.get_mut(key) {
      Some(existing) if existing.is_mapping() && value.is_mapping() => merge_replace(existing, value),
      Some(existing) => *existing = value.clone(),
      None => {
        dst_map.insert(key.clone(), value.clone());
      }
    }
  }
}

/// Recursively add keys from `src` that are missing in `dst`.
pub(crate) fn merge_missing(dst: &mut Value, src: &Value) {
  let (Value::Mapping(dst_map), Value::Mapping(src_map)) = (dst, src) else {
    return;
  };
  for (key, value) in src_map {
    match dst_map.get_mut(key) {
      Some(existing) => merge_missing(existing, value),
      None => {
        dst_map.insert(key.clone(), value.clone());
      }
    }
  }
}

fn set_dotted(root: &mut Value, key: &str, value: Value, overwrite: bool) {
  let mut current = root;
  let parts: Vec<&str> = key.split('.').collect();
  for part in &parts[..parts.len() - 1] {
    if !matches!(current, Value::Mapping(_)) {
      *current = Value::Mapping(Mapping::new());
    }
    let map = current.as_mapping_mut().unwrap();
    let entry_key = Value::String((*part).to_string());
    if !map.contains_key(&entry_key) {
      map.insert(entry_key.clone(), Value::Mapping(Mapping::new()));
    }
    current = map.get_mut(&entry_key).unwrap();
  }
  if !matches!(current, Value::Mapping(_)) {
    *current = Value::Mapping(Mapping::new());
  }
  let map = current.as_mapping_mut().unwrap();
  let leaf = Value::String(parts[parts.len() - 1].to_string());
  let is_unset = matches!(map.get(&leaf), None | Some(Value::Null));
  if overwrite || is_unset {
    map.insert(leaf, value);
  }
}

/// String form of a config value for `[key]` substitution.
pub fn value_display(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dotted_get_and_set() {
    let mut store = ConfigStore::empty();
    store.set_value("segment.model", Value::String("blingbring".into())).unwrap();
    assert_eq!(store.get_str("segment.model"), Some("blingbring"));
    assert!(store.get("segment.missing").is_none());
  }

  #[test]
  fn test_set_default_does_not_override() {
    let mut store = ConfigStore::empty();
    store.set_value("a.b", Value::String("explicit".into())).unwrap();
    store.set_default("a.b", Value::String("default".into())).unwrap();
    store.set_default("a.c", Value::String("default".into())).unwrap();
    assert_eq!(store.get_str("a.b"), Some("explicit"));
    assert_eq!(store.get_str("a.c"), Some("default"));
  }

  #[test]
  fn test_null_counts_as_unset() {
    let store = ConfigStore::from_yaml("a:\n  b:\n").unwrap();
    assert!(store.get("a.b").is_none());
  }

  #[test]
  fn test_frozen_store_rejects_mutation() {
    let mut store = ConfigStore::empty();
    store.freeze();
    assert!(store.set_value("a.b", Value::Bool(true)).is_err());
  }

  #[test]
  fn test_parent_chain_merge_and_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
      tmp.path().join("grandparent.yaml"),
      "metadata:\n  language: swe\nexport:\n  annotations: [segment.token]\n",
    )
    .unwrap();
    std::fs::write(
      tmp.path().join("parent.yaml"),
      "parent: grandparent.yaml\nmetadata:\n  id: from-parent\n",
    )
    .unwrap();
    std::fs::write(
      tmp.path().join(crate::dirs::CONFIG_FILE),
      "parent: parent.yaml\nmetadata:\n  id: corpus\n",
    )
    .unwrap();

    let paths = Paths::with_data_dir(tmp.path(), tmp.path().join("no-data"));
    let store = ConfigStore::load(&paths).unwrap();
    // corpus overrides parent; grandparent values shine through
    assert_eq!(store.get_str("metadata.id"), Some("corpus"));
    assert_eq!(store.get_str("metadata.language"), Some("swe"));
    assert_eq!(store.get_string_list("export.annotations"), vec!["segment.token"]);

    // introduce a cycle
    std::fs::write(tmp.path().join("grandparent.yaml"), format!("parent: {}\n", crate::dirs::CONFIG_FILE)).unwrap();
    let err = ConfigStore::load(&paths).unwrap_err();
    assert!(matches!(err, Error::ConfigCycle(_)));
  }

  #[test]
  fn test_missing_parent_fails() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(crate::dirs::CONFIG_FILE), "parent: nowhere.yaml\n").unwrap();
    let paths = Paths::with_data_dir(tmp.path(), tmp.path().join("no-data"));
    assert!(matches!(ConfigStore::load(&paths).unwrap_err(), Error::ConfigNotFound(_)));
  }

  #[test]
  fn test_inherit_section() {
    let mut store = ConfigStore::from_yaml("import:\n  encoding: latin-1\n").unwrap();
    store
      .declare(ConfigKeySpec::new("xml_import.encoding", "Source encoding"), "xml_import")
      .unwrap();
    store.inherit_section("import", "xml_import").unwrap();
    assert_eq!(store.get_str("xml_import.encoding"), Some("latin-1"));

    // an explicit value wins over inheritance
    let mut store = ConfigStore::from_yaml("import:\n  encoding: latin-1\nxml_import:\n  encoding: utf-8\n").unwrap();
    store
      .declare(ConfigKeySpec::new("xml_import.encoding", "Source encoding"), "xml_import")
      .unwrap();
    store.inherit_section("import", "xml_import").unwrap();
    assert_eq!(store.get_str("xml_import.encoding"), Some("utf-8"));
  }

  #[test]
  fn test_incompatible_redeclaration() {
    let mut store = ConfigStore::empty();
    store.declare(ConfigKeySpec::new("m.key", "First"), "m:one").unwrap();
    assert!(store.declare(ConfigKeySpec::new("m.key", "First"), "m:two").is_ok());
    assert!(store.declare(ConfigKeySpec::new("m.key", "Different"), "m:three").is_err());
  }

  #[test]
  fn test_usage_validation() {
    let mut store = ConfigStore::empty();
    store.declare(ConfigKeySpec::new("m.key", "A key"), "m:f").unwrap();
    store.add_usage("m.key", "m:f");
    assert!(store.validate_usage().is_ok());
    store.add_usage("other.key", "m:f");
    assert!(store.validate_usage().is_err());
  }

  #[test]
  fn test_value_display() {
    assert_eq!(value_display(&Value::String("x".into())), "x");
    assert_eq!(value_display(&Value::Bool(true)), "true");
    assert_eq!(value_display(&serde_yaml::from_str("3").unwrap()), "3");
  }
}
