//! Annotation presets.
//!
//! Preset files live under the data directory (`config/presets/*.yaml`).
//! Each file defines a preset group named after the file stem (upper-cased),
//! with member lists under `presets:` and optional class bindings under
//! `classes:`. A `languages:` list restricts the group to matching corpora.
//!
//! Inside annotation lists, a preset identifier (`SWE_DEFAULT.saldo`)
//! expands to its members, recursively; anything else passes through
//! unchanged. `not <ref>` exclusions and the `...` token are not preset
//! syntax: they belong to source-annotation lists, resolved against a
//! source file's structure (see `model::parse_annotation_list`).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_yaml::Value;
use tracing::debug;

use super::ConfigStore;
use crate::model::check_language;
use crate::Result;

/// All presets applicable to the corpus language.
#[derive(Debug, Clone, Default)]
pub struct PresetLibrary {
  /// Fully qualified preset name -> member entries (which may themselves be
  /// preset names).
  presets: BTreeMap<String, Vec<String>>,
  /// Preset name -> class bindings it establishes.
  classes: BTreeMap<String, BTreeMap<String, String>>,
}

impl PresetLibrary {
  /// Read every preset file under `presets_dir`, skipping groups that do
  /// not cover the corpus language.
  pub fn load(presets_dir: &Path, language: &str, variety: Option<&str>) -> Result<Self> {
    let mut library = Self::default();
    if !presets_dir.is_dir() {
      return Ok(library);
    }

    let mut entries: Vec<_> = std::fs::read_dir(presets_dir)?
      .filter_map(|e| e.ok())
      .map(|e| e.path())
      .filter(|p| p.extension().is_some_and(|e| e == "yaml" || e == "yml"))
      .collect();
    entries.sort();

    for path in entries {
      let doc: Value = serde_yaml::from_str(&std::fs::read_to_string(&path)?)?;

      let languages: Vec<String> = match doc.get("languages") {
        Some(Value::Sequence(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
      };
      if !check_language(language, &languages, variety) {
        continue;
      }

      let group = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_uppercase();

      let classes: BTreeMap<String, String> = match doc.get("classes") {
        Some(Value::Mapping(map)) => map
          .iter()
          .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
          .collect(),
        _ => BTreeMap::new(),
      };

      let Some(Value::Mapping(presets)) = doc.get("presets") else {
        continue;
      };
      let local_names: BTreeSet<String> = presets.iter().filter_map(|(k, _)| k.as_str().map(str::to_string)).collect();

      for (name, members) in presets {
        let Some(name) = name.as_str() else { continue };
        let Some(members) = members.as_sequence() else { continue };
        let qualified = format!("{group}.{name}");
        let members: Vec<String> = members
          .iter()
          .filter_map(|v| v.as_str())
          .map(|m| {
            // Members naming a sibling preset get the group prefix
            if local_names.contains(m) {
              format!("{group}.{m}")
            } else {
              m.to_string()
            }
          })
          .collect();
        if !classes.is_empty() {
          library.classes.insert(qualified.clone(), classes.clone());
        }
        library.presets.insert(qualified, members);
      }
    }

    debug!(presets = library.presets.len(), "loaded preset library");
    Ok(library)
  }

  pub fn is_preset(&self, name: &str) -> bool {
    self.presets.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &String> {
    self.presets.keys()
  }

  pub fn members(&self, name: &str) -> Option<&[String]> {
    self.presets.get(name).map(Vec::as_slice)
  }

  /// Expand one annotation list: preset identifiers are replaced by their
  /// expansions (recursively); other entries pass through unchanged.
  /// Returns the deduplicated expansion plus the class bindings established
  /// by the presets that were used.
  pub fn expand_list(&self, entries: &[String]) -> (Vec<String>, BTreeMap<String, String>) {
    let mut expanded: Vec<String> = Vec::new();
    let mut classes: BTreeMap<String, String> = BTreeMap::new();

    for entry in entries {
      self.expand_into(entry.trim(), &mut expanded, &mut classes, &mut BTreeSet::new());
    }

    let mut seen = BTreeSet::new();
    let result = expanded.into_iter().filter(|a| seen.insert(a.clone())).collect();
    (result, classes)
  }

  fn expand_into(
    &self,
    entry: &str,
    out: &mut Vec<String>,
    classes: &mut BTreeMap<String, String>,
    in_progress: &mut BTreeSet<String>,
  ) {
    let Some(members) = self.presets.get(entry) else {
      out.push(entry.to_string());
      return;
    };
    // A preset referring to itself (directly or via another preset) expands
    // to nothing further
    if !in_progress.insert(entry.to_string()) {
      return;
    }
    if let Some(preset_classes) = self.classes.get(entry) {
      for (class, annotation) in preset_classes {
        classes.entry(class.clone()).or_insert_with(|| annotation.clone());
      }
    }
    for member in members {
      self.expand_into(member, out, classes, in_progress);
    }
    in_progress.remove(entry);
  }
}

/// Replace preset references in every annotation-list config key and apply
/// preset class bindings (kept below explicitly configured classes).
pub fn apply_presets(store: &mut ConfigStore, library: &PresetLibrary, annotation_sources: &BTreeSet<String>) -> Result<()> {
  let mut all_classes: BTreeMap<String, String> = BTreeMap::new();

  for key in annotation_sources {
    let entries = store.get_string_list(key);
    if entries.is_empty() {
      continue;
    }
    let (expanded, classes) = library.expand_list(&entries);
    for (class, annotation) in classes {
      all_classes.entry(class).or_insert(annotation);
    }
    store.set_value(key, Value::Sequence(expanded.into_iter().map(Value::String).collect()))?;
  }

  for (class, annotation) in all_classes {
    store.set_default(&format!("classes.{class}"), Value::String(annotation))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn library() -> PresetLibrary {
    let mut lib = PresetLibrary::default();
    lib.presets.insert(
      "SWE_DEFAULT.all".into(),
      vec!["SWE_DEFAULT.saldo".into(), "segment.sentence".into()],
    );
    lib.presets.insert(
      "SWE_DEFAULT.saldo".into(),
      vec!["segment.token:saldo.baseform".into(), "segment.token:saldo.pos".into()],
    );
    lib
      .classes
      .insert("SWE_DEFAULT.saldo".into(), BTreeMap::from([("token".into(), "segment.token".into())]));
    lib
  }

  #[test]
  fn test_expand_nested_preset() {
    let lib = library();
    let (expanded, classes) = lib.expand_list(&["SWE_DEFAULT.all".to_string()]);
    assert_eq!(
      expanded,
      vec!["segment.token:saldo.baseform", "segment.token:saldo.pos", "segment.sentence"]
    );
    assert_eq!(classes.get("token").map(String::as_str), Some("segment.token"));
  }

  #[test]
  fn test_non_preset_entries_pass_through_verbatim() {
    // exclusion/rest tokens are not preset syntax and survive expansion
    let lib = library();
    let (expanded, _) = lib.expand_list(&[
      "SWE_DEFAULT.saldo".to_string(),
      "not xml.footnote".to_string(),
      "...".to_string(),
    ]);
    assert_eq!(
      expanded,
      vec![
        "segment.token:saldo.baseform",
        "segment.token:saldo.pos",
        "not xml.footnote",
        "..."
      ]
    );
  }

  #[test]
  fn test_plain_annotations_pass_through() {
    let lib = PresetLibrary::default();
    let (expanded, classes) = lib.expand_list(&["segment.token".to_string()]);
    assert_eq!(expanded, vec!["segment.token"]);
    assert!(classes.is_empty());
  }

  #[test]
  fn test_load_filters_by_language() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
      tmp.path().join("swe_default.yaml"),
      "languages: [swe]\npresets:\n  saldo:\n    - segment.token:saldo.baseform\n",
    )
    .unwrap();
    std::fs::write(
      tmp.path().join("fin_default.yaml"),
      "languages: [fin]\npresets:\n  base:\n    - segment.token:fin.lemma\n",
    )
    .unwrap();

    let lib = PresetLibrary::load(tmp.path(), "swe", None).unwrap();
    assert!(lib.is_preset("SWE_DEFAULT.saldo"));
    assert!(!lib.is_preset("FIN_DEFAULT.base"));
  }

  #[test]
  fn test_apply_presets_rewrites_config() {
    let lib = library();
    let mut store = ConfigStore::from_yaml("export:\n  annotations:\n    - SWE_DEFAULT.saldo\n").unwrap();
    let sources = BTreeSet::from(["export.annotations".to_string()]);
    apply_presets(&mut store, &lib, &sources).unwrap();
    assert_eq!(
      store.get_string_list("export.annotations"),
      vec!["segment.token:saldo.baseform", "segment.token:saldo.pos"]
    );
    assert_eq!(store.get_str("classes.token"), Some("segment.token"));
  }
}
