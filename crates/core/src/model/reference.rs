//! Annotation references.
//!
//! A reference is a textual name of the form `prefix.base` (a span) or
//! `prefix.base:prefix.attr` (an attribute on a span). Before resolution it
//! may additionally contain class placeholders in angle brackets
//! (`<token>`, `<token:word>`), configuration placeholders in square
//! brackets (`[wsd.sense_model]`, optionally `[key=default]`) and wildcards
//! in curly braces (`{annotation}`).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn class_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"<([^>]+)>").unwrap())
}

fn config_var_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\[([^\]=\[]+)(?:=([^\]\[]+))?\]").unwrap())
}

fn wildcard_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\{([a-z][a-z0-9_]*)\}").unwrap())
}

fn concrete_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  // prefix.base with an optional prefix.attr part
  RE.get_or_init(|| {
    Regex::new(r"^[a-z0-9_-]+(\.[a-z0-9_-]+)+(:[a-z0-9_-]+(\.[a-z0-9_-]+)+)?$").unwrap()
  })
}

/// A (possibly unresolved) annotation reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Split into span name and optional attribute at the first colon outside
  /// any bracketed placeholder.
  pub fn split(&self) -> (&str, Option<&str>) {
    let mut depth = 0usize;
    for (i, c) in self.0.char_indices() {
      match c {
        '<' | '[' | '{' => depth += 1,
        '>' | ']' | '}' => depth = depth.saturating_sub(1),
        ':' if depth == 0 => return (&self.0[..i], Some(&self.0[i + 1..])),
        _ => {}
      }
    }
    (&self.0, None)
  }

  /// Span part of the reference (everything before the top-level colon).
  pub fn name(&self) -> &str {
    self.split().0
  }

  /// Attribute part, if any.
  pub fn attribute(&self) -> Option<&str> {
    self.split().1
  }

  pub fn is_attribute(&self) -> bool {
    self.attribute().is_some()
  }

  /// The plain span reference, with any attribute stripped.
  pub fn plain(&self) -> Reference {
    Reference::new(self.name())
  }

  /// Module prefix of the span part (`segment.token` -> `segment`).
  /// Empty when the reference still contains placeholders.
  pub fn module(&self) -> &str {
    let name = self.name();
    match name.find('.') {
      Some(i) if !name.contains(['<', '[', '{']) => &name[..i],
      _ => "",
    }
  }

  /// Class placeholders occurring in the reference, without brackets.
  pub fn classes(&self) -> Vec<String> {
    class_re()
      .captures_iter(&self.0)
      .map(|c| c[1].to_string())
      .collect()
  }

  /// Configuration placeholders as `(key, optional default)` pairs.
  pub fn config_vars(&self) -> Vec<(String, Option<String>)> {
    config_var_re()
      .captures_iter(&self.0)
      .map(|c| (c[1].to_string(), c.get(2).map(|m| m.as_str().to_string())))
      .collect()
  }

  /// Wildcard names occurring in the reference.
  pub fn wildcards(&self) -> Vec<String> {
    wildcard_re()
      .captures_iter(&self.0)
      .map(|c| c[1].to_string())
      .collect()
  }

  pub fn has_classes(&self) -> bool {
    self.0.contains('<')
  }

  pub fn has_config_vars(&self) -> bool {
    config_var_re().is_match(&self.0)
  }

  pub fn has_wildcards(&self) -> bool {
    wildcard_re().is_match(&self.0)
  }

  /// Whether the reference is fully resolved: module-prefixed identifiers
  /// only, no placeholders of any kind.
  pub fn is_concrete(&self) -> bool {
    concrete_re().is_match(&self.0)
  }

  /// Validate the shape of a declared output reference. Placeholders are
  /// allowed; whatever remains outside them must use the legal identifier
  /// alphabet.
  pub fn validate(&self) -> Result<()> {
    if self.0.is_empty() {
      return Err(Error::unresolved(&self.0, "empty reference"));
    }
    let mut stripped = self.0.clone();
    for re in [class_re(), config_var_re(), wildcard_re()] {
      stripped = re.replace_all(&stripped, "x").into_owned();
    }
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    let shape = SHAPE.get_or_init(|| Regex::new(r"^[a-z0-9_.:-]+$").unwrap());
    if !shape.is_match(&stripped) {
      return Err(Error::unresolved(&self.0, "illegal characters in reference"));
    }
    if stripped.matches(':').count() > 1 {
      return Err(Error::unresolved(&self.0, "more than one attribute delimiter"));
    }
    Ok(())
  }

  /// Replace every wildcard with its binding. Unbound wildcards are left as
  /// is so patterns can be instantiated in several steps.
  pub fn bind_wildcards(&self, bindings: &std::collections::BTreeMap<String, String>) -> Reference {
    let replaced = wildcard_re().replace_all(&self.0, |caps: &regex::Captures| {
      bindings
        .get(&caps[1])
        .cloned()
        .unwrap_or_else(|| caps[0].to_string())
    });
    Reference::new(replaced.into_owned())
  }
}

impl fmt::Display for Reference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for Reference {
  fn from(value: &str) -> Self {
    Reference::new(value)
  }
}

impl From<String> for Reference {
  fn from(value: String) -> Self {
    Reference(value)
  }
}

/// Parse an annotation list from config: entries are references, optionally
/// renamed with `ref as exportname`. Returns `(reference, export name)`
/// pairs, keeping the last occurrence when an entry repeats.
///
/// With `available` given (source/header annotation lists, resolved against
/// the source file's structure at job time), two extra entry forms apply:
/// `not <ref>` removes a reference from the result (removing a plain
/// annotation also removes its attributes), and `...` stands for every
/// available annotation not otherwise mentioned. A list containing only
/// exclusions implies `...`. An empty list with `available` yields all
/// available annotations.
///
/// When `add_plain` is set, missing span parents of attribute entries are
/// appended (unnamed) so exports always see the spans their attributes hang
/// off.
pub fn parse_annotation_list(
  entries: &[String],
  available: Option<&[Reference]>,
  add_plain: bool,
) -> Vec<(Reference, Option<String>)> {
  let available = available.unwrap_or(&[]);
  if entries.is_empty() {
    return available.iter().map(|a| (a.clone(), None)).collect();
  }

  let mut result: Vec<(Reference, Option<String>)> = Vec::new();
  let mut omitted: Vec<Reference> = Vec::new();
  let mut include_rest = false;

  for entry in entries {
    let entry = entry.trim();
    if entry == "..." {
      include_rest = true;
      continue;
    }
    if let Some(negated) = entry.strip_prefix("not ")
      && !entry.contains(" as ")
    {
      omitted.push(Reference::new(negated.trim()));
      continue;
    }
    let (reference, export_name) = match entry.split_once(" as ") {
      Some((r, n)) => (Reference::new(r.trim()), Some(n.trim().to_string())),
      None => (Reference::new(entry), None),
    };
    // The last occurrence wins, and keeps its position
    result.retain(|(r, _)| r != &reference);
    result.push((reference, export_name));
  }

  // A list of nothing but exclusions means "everything else"
  if !omitted.is_empty() && result.is_empty() {
    include_rest = true;
  }

  if include_rest {
    for annotation in available {
      if !result.iter().any(|(r, _)| r == annotation) && !omitted.contains(annotation) {
        result.push((annotation.clone(), None));
      }
    }
  }

  if add_plain {
    let plain_present: Vec<String> = result
      .iter()
      .filter(|(r, _)| !r.is_attribute())
      .map(|(r, _)| r.as_str().to_string())
      .collect();
    let mut parents: Vec<String> = result
      .iter()
      .filter(|(r, _)| r.is_attribute() && !omitted.contains(r))
      .map(|(r, _)| r.name().to_string())
      .collect();
    parents.sort();
    parents.dedup();
    for parent in parents {
      if !plain_present.contains(&parent) && !result.iter().any(|(r, _)| r.as_str() == parent) {
        result.push((Reference::new(parent), None));
      }
    }
  }

  // Excluding a plain annotation also drops the attributes hanging off it
  for omit in &omitted {
    result.retain(|(r, _)| {
      r != omit && !(!omit.is_attribute() && r.is_attribute() && r.name() == omit.as_str())
    });
  }

  result
}
