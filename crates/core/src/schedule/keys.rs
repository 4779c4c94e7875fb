//! Persisted content keys for incremental execution.
//!
//! A content key digests everything that determines a job's outputs: the
//! rule identity, its parameter bindings, the size and mtime of every input
//! file, the configuration subtree the rule is sensitive to, and (unless
//! disabled) the registry hash. Keys are persisted in the work directory
//! and compared on the next run; a matching key with up-to-date outputs
//! means the job can be skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::Result;
use crate::compile::Rule;
use crate::exec::Bindings;

/// File holding the persisted keys, relative to the work directory.
pub const CONTENT_KEYS_FILE: &str = ".content-keys";

/// Map from job identifier to content-key digest, persisted as JSON.
#[derive(Debug, Default)]
pub struct ContentKeyStore {
  path: PathBuf,
  keys: BTreeMap<String, String>,
  dirty: bool,
}

impl ContentKeyStore {
  pub fn load(work_dir: &Path) -> Self {
    let path = work_dir.join(CONTENT_KEYS_FILE);
    let keys = std::fs::read_to_string(&path)
      .ok()
      .and_then(|text| serde_json::from_str(&text).ok())
      .unwrap_or_default();
    Self {
      path,
      keys,
      dirty: false,
    }
  }

  pub fn get(&self, job: &str) -> Option<&str> {
    self.keys.get(job).map(String::as_str)
  }

  pub fn record(&mut self, job: &str, key: String) {
    self.keys.insert(job.to_string(), key);
    self.dirty = true;
  }

  pub fn forget(&mut self, job: &str) {
    if self.keys.remove(job).is_some() {
      self.dirty = true;
    }
  }

  pub fn clear(&mut self) {
    if !self.keys.is_empty() {
      self.keys.clear();
      self.dirty = true;
    }
  }

  /// Write back if anything changed. Only called from the scheduler thread.
  pub fn save(&mut self) -> Result<()> {
    if !self.dirty {
      return Ok(());
    }
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&self.path, serde_json::to_vec_pretty(&self.keys)?)?;
    self.dirty = false;
    debug!(keys = self.keys.len(), "content keys saved");
    Ok(())
  }
}

/// Compute the content key for one job.
///
/// `inputs` are corpus-absolute paths; missing inputs contribute a marker so
/// the key changes once they appear.
pub fn content_key(
  rule: &Rule,
  params: &Bindings,
  inputs: &[PathBuf],
  registry_hash: Option<&str>,
) -> String {
  let mut hasher = Sha256::new();
  hasher.update(rule.id.as_bytes());

  for (name, value) in params {
    hasher.update(name.as_bytes());
    hasher.update(value.fingerprint().as_bytes());
  }

  let mut sorted: Vec<&PathBuf> = inputs.iter().collect();
  sorted.sort();
  for input in sorted {
    hasher.update(input.to_string_lossy().as_bytes());
    match std::fs::metadata(input) {
      Ok(meta) => {
        hasher.update(meta.len().to_le_bytes());
        if let Ok(modified) = meta.modified()
          && let Ok(elapsed) = modified.duration_since(std::time::UNIX_EPOCH)
        {
          hasher.update(elapsed.as_nanos().to_le_bytes());
        }
      }
      Err(_) => hasher.update(b"<missing>"),
    }
  }

  for (key, value) in &rule.config_values {
    hasher.update(key.as_bytes());
    hasher.update(value.as_bytes());
  }

  if let Some(registry_hash) = registry_hash {
    hasher.update(registry_hash.as_bytes());
  }

  format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::ProcessorEntry;
  use crate::testutil::{annotator_info, noop_handler};
  use std::sync::Arc;

  fn rule() -> Rule {
    let info = annotator_info("segment", "tokenize", "segment.token", None);
    Rule {
      id: "segment:tokenize".into(),
      processor: Arc::new(ProcessorEntry {
        info,
        handler: noop_handler(),
      }),
      kind: crate::model::ProcessorKind::Annotator,
      inputs: vec![],
      outputs: vec![],
      params: Bindings::new(),
      file_params: vec![],
      per_file: true,
      order: None,
      priority: 0,
      configs: Default::default(),
      config_values: Default::default(),
      missing_binaries: Default::default(),
      wildcards: vec![],
      preloader: None,
      active: true,
      max_threads: None,
      is_abstract: false,
      conflict_rank: 0,
    }
  }

  #[test]
  fn test_store_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = ContentKeyStore::load(tmp.path());
    store.record("segment:tokenize/doc", "abc123".into());
    store.save().unwrap();

    let store = ContentKeyStore::load(tmp.path());
    assert_eq!(store.get("segment:tokenize/doc"), Some("abc123"));
    assert_eq!(store.get("other"), None);
  }

  #[test]
  fn test_key_changes_with_input_mtime() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input");
    std::fs::write(&input, "one").unwrap();
    let rule = rule();
    let params = Bindings::new();

    let key1 = content_key(&rule, &params, &[input.clone()], None);
    let key_same = content_key(&rule, &params, &[input.clone()], None);
    assert_eq!(key1, key_same);

    std::fs::write(&input, "two!").unwrap();
    let key2 = content_key(&rule, &params, &[input.clone()], None);
    assert_ne!(key1, key2);
  }

  #[test]
  fn test_key_changes_with_config_snapshot() {
    let mut rule_a = rule();
    rule_a.config_values.insert("tagger.model".into(), "a".into());
    let mut rule_b = rule();
    rule_b.config_values.insert("tagger.model".into(), "b".into());
    let params = Bindings::new();
    assert_ne!(content_key(&rule_a, &params, &[], None), content_key(&rule_b, &params, &[], None));
  }

  #[test]
  fn test_key_changes_with_registry_hash() {
    let rule = rule();
    let params = Bindings::new();
    let with = content_key(&rule, &params, &[], Some("reg1"));
    let without = content_key(&rule, &params, &[], None);
    let other = content_key(&rule, &params, &[], Some("reg2"));
    assert_ne!(with, without);
    assert_ne!(with, other);
  }

  #[test]
  fn test_missing_input_marker() {
    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("model");
    let rule = rule();
    let params = Bindings::new();
    let before = content_key(&rule, &params, &[input.clone()], None);
    std::fs::write(&input, "model data").unwrap();
    let after = content_key(&rule, &params, &[input], None);
    assert_ne!(before, after);
  }
}
