//! Reference resolution.
//!
//! Turns raw annotation references into concrete ones by substituting
//! `[config]` placeholders (first) and `<class>` placeholders (second,
//! recursively). Wildcards survive resolution; they are bound later when a
//! rule pattern is instantiated against a concrete output request.
//!
//! Class bindings come from the `classes` config section, falling back to
//! the single `cls=`-tagged producer in the registry. Several candidates
//! without a config binding make the class ambiguous: an [`Arbiter`] may
//! pick one (the choice is persisted per corpus), otherwise using the class
//! fails with `ClassAmbiguous`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigStore;
use crate::registry::Registry;
use crate::{Error, Result};

/// Capability object for interactive choices. Non-interactive runs use
/// [`NoArbiter`] and fail with the corresponding error instead of guessing.
pub trait Arbiter {
  /// Pick one of `options`, or `None` to decline.
  fn choose(&self, prompt: &str, options: &[String]) -> Option<usize>;
}

/// Declines every choice.
pub struct NoArbiter;

impl Arbiter for NoArbiter {
  fn choose(&self, _prompt: &str, _options: &[String]) -> Option<usize> {
    None
  }
}

/// Interactive decisions remembered across runs, stored per corpus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decisions {
  /// Class name -> chosen annotation target.
  #[serde(default)]
  pub classes: BTreeMap<String, String>,
  /// Normalised conflict-set key -> chosen rule identifier.
  #[serde(default)]
  pub orders: BTreeMap<String, String>,
}

impl Decisions {
  pub fn load(path: &Path) -> Self {
    std::fs::read_to_string(path)
      .ok()
      .and_then(|text| serde_yaml::from_str(&text).ok())
      .unwrap_or_default()
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(self)?)?;
    Ok(())
  }
}

/// Result of expanding one reference.
#[derive(Debug, Clone, Default)]
pub struct Expanded {
  /// The expanded text; `None` when a placeholder had no value and the
  /// surrounding rule should be suppressed.
  pub value: Option<String>,
  /// Config keys that had no value (suppression, not an error).
  pub missing_configs: BTreeSet<String>,
  /// Classes with no binding at all (suppression, not an error).
  pub missing_classes: BTreeSet<String>,
  /// Config keys the expansion read (content-key sensitivity).
  pub used_configs: BTreeSet<String>,
}

/// Frozen resolution state for one engine run.
pub struct Resolver<'a> {
  config: &'a ConfigStore,
  /// Effective class bindings.
  classes: BTreeMap<String, String>,
  /// Classes with multiple candidates and no binding.
  ambiguous: BTreeMap<String, Vec<String>>,
  /// Expanded references explicitly requested by annotation lists; used to
  /// pick among comma-separated alternatives.
  explicit: BTreeSet<String>,
}

impl<'a> Resolver<'a> {
  /// Build the class table and explicit-annotation set. Interactive picks
  /// are written back into `decisions` (caller persists them).
  pub fn new(
    config: &'a ConfigStore,
    registry: &Registry,
    decisions: &mut Decisions,
    arbiter: &dyn Arbiter,
  ) -> Result<Self> {
    let mut classes: BTreeMap<String, String> = BTreeMap::new();
    let mut ambiguous: BTreeMap<String, Vec<String>> = BTreeMap::new();

    // Config bindings take precedence over module candidates
    if let Some(config_classes) = config.get("classes").and_then(|v| v.as_mapping()) {
      for (key, value) in config_classes {
        if let (Some(class), Some(target)) = (key.as_str(), value.as_str()) {
          classes.insert(class.to_string(), target.to_string());
        }
      }
    }

    for (class, candidates) in registry.class_candidates() {
      if classes.contains_key(class) {
        continue;
      }
      if candidates.len() == 1 {
        classes.insert(class.clone(), candidates[0].clone());
        continue;
      }
      // Remembered decision, then interactive arbitration, then ambiguity
      if let Some(chosen) = decisions.classes.get(class)
        && candidates.contains(chosen)
      {
        classes.insert(class.clone(), chosen.clone());
        continue;
      }
      let prompt = format!("Several annotations can bind the class <{class}>");
      if let Some(index) = arbiter.choose(&prompt, candidates) {
        let chosen = candidates[index].clone();
        decisions.classes.insert(class.clone(), chosen.clone());
        classes.insert(class.clone(), chosen);
      } else {
        ambiguous.insert(class.clone(), candidates.clone());
      }
    }

    let mut resolver = Resolver {
      config,
      classes,
      ambiguous,
      explicit: BTreeSet::new(),
    };

    // Collect explicitly requested annotations, class-expanded where
    // possible; exclusion entries and the rest token are list syntax, not
    // annotations
    let mut explicit = BTreeSet::new();
    for source in registry.annotation_sources() {
      for entry in config.get_string_list(source) {
        let raw = entry.split(" as ").next().unwrap_or(&entry).trim().to_string();
        if raw == "..." || raw.starts_with("not ") {
          continue;
        }
        if let Ok(expansion) = resolver.expand(&raw)
          && let Some(value) = expansion.value
        {
          explicit.insert(value);
        }
        explicit.insert(raw);
      }
    }
    resolver.explicit = explicit;

    debug!(classes = resolver.classes.len(), ambiguous = resolver.ambiguous.len(), "resolver ready");
    Ok(resolver)
  }

  /// Effective class bindings (for `weft classes`).
  pub fn classes(&self) -> &BTreeMap<String, String> {
    &self.classes
  }

  /// Annotations explicitly requested through annotation-list config keys.
  pub fn explicit_annotations(&self) -> &BTreeSet<String> {
    &self.explicit
  }

  /// Expand a reference: `[config]` substitution, then alternative
  /// selection, then recursive `<class>` expansion.
  pub fn expand(&self, raw: &str) -> Result<Expanded> {
    let mut result = Expanded::default();

    // Alternatives are comma-separated; config substitution may itself
    // introduce further alternatives
    let mut alternatives: Vec<String> = Vec::new();
    for part in raw.split(", ") {
      let substituted = self.substitute_configs(part, &mut result)?;
      for sub_part in substituted.split(", ") {
        alternatives.push(sub_part.to_string());
      }
    }

    let mut chosen: Option<String> = None;
    for alternative in &alternatives {
      let expanded = self.expand_classes(alternative, &mut BTreeSet::new(), &mut result)?;
      let Some(expanded) = expanded else { continue };
      let is_last = Some(alternative) == alternatives.last();
      // Prefer the first alternative that is explicitly requested or
      // class-bound; fall back to the last one
      if self.explicit.contains(&expanded) || self.classes.values().any(|v| v == &expanded) || is_last {
        chosen = Some(expanded);
        break;
      }
      chosen = Some(expanded);
      if alternatives.len() == 1 {
        break;
      }
    }

    if result.missing_configs.is_empty() && result.missing_classes.is_empty() {
      result.value = chosen;
    }
    Ok(result)
  }

  fn substitute_configs(&self, text: &str, result: &mut Expanded) -> Result<String> {
    let mut current = text.to_string();
    // Substituted values may contain further placeholders
    for _ in 0..16 {
      let reference = crate::model::Reference::new(current.clone());
      let vars = reference.config_vars();
      if vars.is_empty() {
        return Ok(current);
      }
      for (key, default) in vars {
        result.used_configs.insert(key.clone());
        let value = self.config.get_display(&key).or(default.clone());
        let token = match &default {
          Some(d) => format!("[{key}={d}]"),
          None => format!("[{key}]"),
        };
        match value {
          Some(value) => current = current.replace(&token, &value),
          None => {
            result.missing_configs.insert(key.clone());
            current = current.replace(&token, "");
          }
        }
      }
    }
    Err(Error::unresolved(text, "configuration placeholders nest too deeply"))
  }

  fn expand_classes(
    &self,
    text: &str,
    parents: &mut BTreeSet<String>,
    result: &mut Expanded,
  ) -> Result<Option<String>> {
    let reference = crate::model::Reference::new(text.to_string());
    let classes = reference.classes();
    if classes.is_empty() {
      return Ok(Some(text.to_string()));
    }

    let mut current = text.to_string();
    for class in classes {
      if parents.contains(&class) {
        return Err(Error::unresolved(
          text,
          format!("the class <{class}> refers to itself, directly or indirectly"),
        ));
      }
      let Some(target) = self.classes.get(&class) else {
        if let Some(candidates) = self.ambiguous.get(&class) {
          return Err(Error::ClassAmbiguous {
            class,
            candidates: candidates.clone(),
          });
        }
        result.missing_classes.insert(class);
        return Ok(None);
      };
      // Class targets may themselves carry config placeholders
      let target = self.substitute_configs(target, result)?;
      parents.insert(class.clone());
      let expanded = self.expand_classes(&target, parents, result)?;
      parents.remove(&class);
      let Some(expanded) = expanded else { return Ok(None) };
      current = current.replacen(&format!("<{class}>"), &expanded, 1);
    }

    // Substituted class targets may themselves carry classes
    if crate::model::Reference::new(current.clone()).has_classes() {
      return self.expand_classes(&current, parents, result);
    }
    Ok(Some(current))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{ModuleSet, Registry};

  struct PickFirst;

  impl Arbiter for PickFirst {
    fn choose(&self, _prompt: &str, _options: &[String]) -> Option<usize> {
      Some(0)
    }
  }

  use crate::testutil::annotator_module;

  fn setup(yaml: &str, modules: Vec<ModuleSet>) -> (ConfigStore, Registry) {
    let mut config = ConfigStore::from_yaml(yaml).unwrap();
    let registry = Registry::discover(modules, &mut config).unwrap();
    (config, registry)
  }

  #[test]
  fn test_implicit_single_candidate_class() {
    let (config, registry) = setup("", vec![annotator_module("segment", &[("segment.token", Some("token"))])]);
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    let expanded = resolver.expand("<token>:misc.id").unwrap();
    assert_eq!(expanded.value.as_deref(), Some("segment.token:misc.id"));
  }

  #[test]
  fn test_config_binding_overrides_module_class() {
    let (config, registry) = setup(
      "classes:\n  token: other.token\n",
      vec![annotator_module("segment", &[("segment.token", Some("token"))])],
    );
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    assert_eq!(resolver.expand("<token>").unwrap().value.as_deref(), Some("other.token"));
  }

  #[test]
  fn test_ambiguous_class_fails_without_arbiter() {
    let (config, registry) = setup(
      "",
      vec![
        annotator_module("one", &[("one.token", Some("token"))]),
        annotator_module("two", &[("two.token", Some("token"))]),
      ],
    );
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    assert!(matches!(resolver.expand("<token>").unwrap_err(), Error::ClassAmbiguous { .. }));
  }

  #[test]
  fn test_arbiter_choice_is_persisted() {
    let (config, registry) = setup(
      "",
      vec![
        annotator_module("one", &[("one.token", Some("token"))]),
        annotator_module("two", &[("two.token", Some("token"))]),
      ],
    );
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &PickFirst).unwrap();
    assert_eq!(resolver.expand("<token>").unwrap().value.as_deref(), Some("one.token"));
    assert_eq!(decisions.classes.get("token").map(String::as_str), Some("one.token"));

    // a later non-interactive run reuses the recorded pick
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    assert_eq!(resolver.expand("<token>").unwrap().value.as_deref(), Some("one.token"));
  }

  #[test]
  fn test_config_placeholder_substitution() {
    let (config, registry) = setup(
      "wsd:\n  model: sense-v2\n",
      vec![annotator_module("segment", &[("segment.token", Some("token"))])],
    );
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    let expanded = resolver.expand("<token>:wsd.[wsd.model]").unwrap();
    assert_eq!(expanded.value.as_deref(), Some("segment.token:wsd.sense-v2"));
    assert!(expanded.used_configs.contains("wsd.model"));
  }

  #[test]
  fn test_missing_config_suppresses() {
    let (config, registry) = setup("", vec![annotator_module("segment", &[("segment.token", Some("token"))])]);
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    let expanded = resolver.expand("<token>:wsd.[wsd.model]").unwrap();
    assert!(expanded.value.is_none());
    assert!(expanded.missing_configs.contains("wsd.model"));
  }

  #[test]
  fn test_config_placeholder_default() {
    let (config, registry) = setup("", vec![annotator_module("segment", &[("segment.token", Some("token"))])]);
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    let expanded = resolver.expand("<token>:wsd.[wsd.model=base]").unwrap();
    assert_eq!(expanded.value.as_deref(), Some("segment.token:wsd.base"));
  }

  #[test]
  fn test_class_cycle_detected() {
    let (config, registry) = setup(
      "classes:\n  a: <b>\n  b: <a>\n",
      vec![annotator_module("segment", &[("segment.token", None)])],
    );
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    assert!(matches!(resolver.expand("<a>").unwrap_err(), Error::ReferenceUnresolved { .. }));
  }

  #[test]
  fn test_unknown_class_suppresses() {
    let (config, registry) = setup("", vec![annotator_module("segment", &[("segment.token", None)])]);
    let mut decisions = Decisions::default();
    let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
    let expanded = resolver.expand("<nonexistent>").unwrap();
    assert!(expanded.value.is_none());
    assert!(expanded.missing_classes.contains("nonexistent"));
  }

  #[test]
  fn test_decisions_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join(".weft").join("decisions.yaml");
    let mut decisions = Decisions::default();
    decisions.classes.insert("token".into(), "one.token".into());
    decisions.orders.insert("xml_export".into(), "xml_export:pretty".into());
    decisions.save(&path).unwrap();
    let loaded = Decisions::load(&path);
    assert_eq!(loaded.classes.get("token").map(String::as_str), Some("one.token"));
    assert_eq!(loaded.orders.len(), 1);
  }
}
