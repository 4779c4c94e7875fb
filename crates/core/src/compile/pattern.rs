//! Path patterns with `{file}` and wildcard placeholders.
//!
//! Rule inputs and outputs are stored as patterns relative to the corpus
//! directory (or absolute, for model files). The scheduler instantiates
//! them by binding placeholders, and unifies concrete paths against them to
//! find producers for requested files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder bindings: wildcard name -> concrete value.
pub type WildcardBindings = BTreeMap<String, String>;

fn placeholder_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\{([a-z][a-z0-9_]*)\}").unwrap())
}

/// A path string that may contain `{placeholder}` segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathPattern(String);

impl PathPattern {
  pub fn new(pattern: impl Into<String>) -> Self {
    Self(pattern.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Placeholder names in order of appearance, deduplicated.
  pub fn placeholders(&self) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in placeholder_re().captures_iter(&self.0) {
      let name = caps[1].to_string();
      if !seen.contains(&name) {
        seen.push(name);
      }
    }
    seen
  }

  pub fn is_concrete(&self) -> bool {
    !placeholder_re().is_match(&self.0)
  }

  pub fn has_placeholder(&self, name: &str) -> bool {
    self.placeholders().iter().any(|p| p == name)
  }

  /// Substitute bindings; placeholders without a binding survive.
  pub fn bind(&self, bindings: &WildcardBindings) -> PathPattern {
    let replaced = placeholder_re().replace_all(&self.0, |caps: &regex::Captures| {
      bindings
        .get(&caps[1])
        .cloned()
        .unwrap_or_else(|| caps[0].to_string())
    });
    PathPattern(replaced.into_owned())
  }

  /// A fully bound pattern as a path. `None` if placeholders remain.
  pub fn to_path(&self, bindings: &WildcardBindings) -> Option<PathBuf> {
    let bound = self.bind(bindings);
    bound.is_concrete().then(|| PathBuf::from(bound.0))
  }

  /// Unify a concrete path against this pattern, returning the placeholder
  /// bindings on a match. `{file}` may span directory separators; all other
  /// placeholders bind a single path segment.
  pub fn unify(&self, concrete: &str) -> Option<WildcardBindings> {
    let mut regex_src = String::from("^");
    let mut last = 0;
    // (placeholder, capture group) pairs; repeated placeholders get numbered
    // groups and are checked for consistency afterwards
    let mut groups: Vec<(String, String)> = Vec::new();
    for caps in placeholder_re().captures_iter(&self.0) {
      let whole = caps.get(0).unwrap();
      regex_src.push_str(&regex::escape(&self.0[last..whole.start()]));
      let name = caps[1].to_string();
      let group = format!("g{}", groups.len());
      if name == "file" {
        regex_src.push_str(&format!("(?P<{group}>.+?)"));
      } else {
        regex_src.push_str(&format!("(?P<{group}>[^/]+?)"));
      }
      groups.push((name, group));
      last = whole.end();
    }
    regex_src.push_str(&regex::escape(&self.0[last..]));
    regex_src.push('$');

    let re = Regex::new(&regex_src).ok()?;
    let caps = re.captures(concrete)?;
    let mut bindings = WildcardBindings::new();
    for (name, group) in groups {
      let value = caps.name(&group)?.as_str().to_string();
      if let Some(previous) = bindings.get(&name) {
        if previous != &value {
          return None;
        }
      } else {
        bindings.insert(name, value);
      }
    }
    Some(bindings)
  }
}

impl std::fmt::Display for PathPattern {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}
