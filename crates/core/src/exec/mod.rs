//! Execution contract between the engine and processor bodies.
//!
//! Processor functions are external collaborators; the engine hands them a
//! [`JobContext`] with resolved parameter bindings and path roots, and
//! expects them to read declared inputs and write declared outputs through
//! the context. Outputs go to a staging directory and are renamed into
//! place by the scheduler once the job succeeds, so output visibility is
//! atomic.

pub mod tools;

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::io;
use crate::model::Reference;
use crate::{Error, Result};

/// Warm state held by a preloader worker between jobs.
pub type WarmState = Box<dyn Any + Send>;

/// An export item: a resolved annotation plus its optional export name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportItem {
  pub reference: Reference,
  pub export_name: Option<String>,
}

/// A resolved parameter binding, as passed to a processor body (and over
/// the preloader socket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ParamValue {
  Annotation(Reference),
  Annotations(Vec<Reference>),
  ExportItems(Vec<ExportItem>),
  Str(String),
  /// Raw config-list entries, resolved by the processor at job time (e.g.
  /// source-annotation lists parsed against the file's structure).
  Strings(Vec<String>),
  Path(PathBuf),
  Paths(Vec<PathBuf>),
  Files(Vec<String>),
  Scalar(serde_yaml::Value),
  None,
}

impl ParamValue {
  /// String form used in content keys and preloader fingerprints.
  pub fn fingerprint(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Parameter bindings for one job.
pub type Bindings = BTreeMap<String, ParamValue>;

/// Everything a processor body needs to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
  /// Rule identifier, `<module>:<function>` (plus custom suffix, if any).
  pub rule: String,
  /// Source file the job runs on; `None` for corpus-level jobs.
  pub file: Option<String>,
  pub params: Bindings,
  /// Staging work directory; outputs written here are published on success.
  pub work_dir: PathBuf,
  /// Real work directory; inputs are read from here.
  pub input_dir: PathBuf,
  /// Staging export directory.
  pub export_dir: PathBuf,
  /// Real export directory; installers read published exports from here.
  pub export_input_dir: PathBuf,
  pub source_dir: PathBuf,
  pub models_dir: Option<PathBuf>,
}

impl JobContext {
  fn param(&self, name: &str) -> Result<&ParamValue> {
    self
      .params
      .get(name)
      .ok_or_else(|| Error::RuleFailed {
        rule: self.rule.clone(),
        reason: format!("missing parameter binding '{name}'"),
      })
  }

  fn file_name(&self) -> Result<&str> {
    self.file.as_deref().ok_or_else(|| Error::RuleFailed {
      rule: self.rule.clone(),
      reason: "corpus-level job has no source file".into(),
    })
  }

  // ==========================================================================
  // Binding accessors
  // ==========================================================================

  pub fn annotation(&self, name: &str) -> Result<&Reference> {
    match self.param(name)? {
      ParamValue::Annotation(r) => Ok(r),
      other => Err(self.wrong_kind(name, "annotation", other)),
    }
  }

  pub fn annotations(&self, name: &str) -> Result<&[Reference]> {
    match self.param(name)? {
      ParamValue::Annotations(rs) => Ok(rs),
      other => Err(self.wrong_kind(name, "annotation list", other)),
    }
  }

  pub fn export_items(&self, name: &str) -> Result<&[ExportItem]> {
    match self.param(name)? {
      ParamValue::ExportItems(items) => Ok(items),
      other => Err(self.wrong_kind(name, "export items", other)),
    }
  }

  pub fn string(&self, name: &str) -> Result<&str> {
    match self.param(name)? {
      ParamValue::Str(s) => Ok(s),
      other => Err(self.wrong_kind(name, "string", other)),
    }
  }

  /// Raw list binding; `None` when the config key was never set.
  pub fn strings(&self, name: &str) -> Result<Option<&[String]>> {
    match self.param(name)? {
      ParamValue::Strings(items) => Ok(Some(items)),
      ParamValue::None => Ok(None),
      other => Err(self.wrong_kind(name, "string list", other)),
    }
  }

  pub fn path(&self, name: &str) -> Result<&Path> {
    match self.param(name)? {
      ParamValue::Path(p) => Ok(p),
      other => Err(self.wrong_kind(name, "path", other)),
    }
  }

  pub fn files(&self, name: &str) -> Result<&[String]> {
    match self.param(name)? {
      ParamValue::Files(fs) => Ok(fs),
      other => Err(self.wrong_kind(name, "file list", other)),
    }
  }

  pub fn scalar(&self, name: &str) -> Result<&serde_yaml::Value> {
    match self.param(name)? {
      ParamValue::Scalar(v) => Ok(v),
      other => Err(self.wrong_kind(name, "scalar", other)),
    }
  }

  pub fn opt_string(&self, name: &str) -> Option<&str> {
    match self.params.get(name) {
      Some(ParamValue::Str(s)) => Some(s),
      _ => None,
    }
  }

  fn wrong_kind(&self, name: &str, expected: &str, got: &ParamValue) -> Error {
    Error::RuleFailed {
      rule: self.rule.clone(),
      reason: format!("parameter '{name}' is not an {expected}: {got:?}"),
    }
  }

  // ==========================================================================
  // Annotation I/O (inputs from the real work dir, outputs to staging)
  // ==========================================================================

  pub fn read_text(&self) -> Result<String> {
    io::read_text(&self.input_dir, self.file_name()?)
  }

  pub fn read_spans(&self, reference: &Reference) -> Result<Vec<io::Span>> {
    io::read_spans(&self.input_dir, self.file_name()?, reference)
  }

  pub fn read_values(&self, reference: &Reference) -> Result<Vec<String>> {
    io::read_values(&self.input_dir, self.file_name()?, reference)
  }

  pub fn read_span_texts(&self, reference: &Reference) -> Result<Vec<String>> {
    io::read_span_texts(&self.input_dir, self.file_name()?, reference)
  }

  pub fn read_data(&self, reference: &Reference) -> Result<Vec<u8>> {
    io::read_data(&self.input_dir, self.file.as_deref(), reference)
  }

  /// Read an annotation belonging to another source file (corpus-level
  /// consumers iterating over all files).
  pub fn read_spans_of(&self, file: &str, reference: &Reference) -> Result<Vec<io::Span>> {
    io::read_spans(&self.input_dir, file, reference)
  }

  pub fn read_values_of(&self, file: &str, reference: &Reference) -> Result<Vec<String>> {
    io::read_values(&self.input_dir, file, reference)
  }

  pub fn read_text_of(&self, file: &str) -> Result<String> {
    io::read_text(&self.input_dir, file)
  }

  pub fn write_text(&self, text: &str) -> Result<()> {
    io::write_text(&self.work_dir, self.file_name()?, text)
  }

  pub fn write_structure(&self, annotations: &[Reference]) -> Result<()> {
    io::write_structure(&self.work_dir, self.file_name()?, annotations)
  }

  pub fn write_spans(&self, reference: &Reference, spans: &[io::Span]) -> Result<()> {
    io::write_spans(&self.work_dir, self.file_name()?, reference, spans)
  }

  pub fn write_values(&self, reference: &Reference, values: &[String]) -> Result<()> {
    io::write_values(&self.work_dir, self.file_name()?, reference, values)
  }

  pub fn write_data(&self, reference: &Reference, bytes: &[u8]) -> Result<()> {
    io::write_data(&self.work_dir, self.file.as_deref(), reference, bytes)
  }

  /// Write the zero-length sentinel of an installer/uninstaller marker.
  pub fn write_marker(&self, reference: &Reference) -> Result<()> {
    io::write_data(&self.work_dir, None, reference, b"")
  }

  /// Remove a marker (installers clear their uninstaller's marker and vice
  /// versa). Operates on the real work dir; missing markers are fine.
  pub fn remove_marker(&self, reference: &Reference) -> Result<()> {
    let path = io::annotation_path(&self.input_dir, None, reference, true);
    match std::fs::remove_file(path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// Absolute path for an export output, under the staging export dir.
  pub fn export_path(&self, relative: &str) -> Result<PathBuf> {
    let path = self.export_dir.join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Ok(path)
  }

  /// Absolute path of a published export consumed as input.
  pub fn export_input_path(&self, relative: &str) -> PathBuf {
    self.export_input_dir.join(relative)
  }

  /// Absolute path of the source file for an importer job.
  pub fn source_path(&self, extension: &str) -> Result<PathBuf> {
    Ok(self.source_dir.join(format!("{}.{extension}", self.file_name()?)))
  }
}

/// A processor body. Implementations are synchronous; the scheduler runs
/// them on blocking worker threads.
pub trait Handler: Send + Sync {
  /// Run one job.
  fn execute(&self, ctx: &JobContext) -> Result<()>;

  /// Preload hook: build the warm state from the preloader parameter
  /// bindings. Only called for processors that declare a preloader.
  fn preload(&self, _params: &Bindings) -> Result<WarmState> {
    Err(Error::User("processor does not support preloading".into()))
  }

  /// Run one job with warm state. Defaults to the cold path.
  fn execute_preloaded(&self, ctx: &JobContext, _warm: &mut WarmState) -> Result<()> {
    self.execute(ctx)
  }

  /// Post-job cleanup hook; the returned state replaces the worker's warm
  /// state (supports restarting external processes periodically).
  fn cleanup(&self, warm: WarmState, _params: &Bindings) -> Result<WarmState> {
    Ok(warm)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn context(tmp: &Path) -> JobContext {
    JobContext {
      rule: "segment:tokenize".into(),
      file: Some("doc".into()),
      params: BTreeMap::from([
        ("out".to_string(), ParamValue::Annotation(Reference::new("segment.token"))),
        ("chunk".to_string(), ParamValue::Str("sentence".into())),
      ]),
      work_dir: tmp.join("staging"),
      input_dir: tmp.join("work"),
      export_dir: tmp.join("export-staging"),
      export_input_dir: tmp.join("export"),
      source_dir: tmp.join("source"),
      models_dir: None,
    }
  }

  #[test]
  fn test_typed_accessors() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(tmp.path());
    assert_eq!(ctx.annotation("out").unwrap().as_str(), "segment.token");
    assert_eq!(ctx.string("chunk").unwrap(), "sentence");
    assert!(ctx.annotation("chunk").is_err());
    assert!(ctx.string("nope").is_err());
  }

  #[test]
  fn test_outputs_go_to_staging() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = context(tmp.path());
    io::write_text(&ctx.input_dir, "doc", "ab cd").unwrap();

    let token = Reference::new("segment.token");
    ctx.write_spans(&token, &[(0, 2), (3, 5)]).unwrap();

    // staged, not published
    assert!(io::annotation_exists(&ctx.work_dir, Some("doc"), &token, false));
    assert!(!io::annotation_exists(&ctx.input_dir, Some("doc"), &token, false));
  }

  #[test]
  fn test_param_fingerprint_is_stable() {
    let a = ParamValue::Annotation(Reference::new("segment.token"));
    let b = ParamValue::Annotation(Reference::new("segment.token"));
    assert_eq!(a.fingerprint(), b.fingerprint());
    let c = ParamValue::Str("other".into());
    assert_ne!(a.fingerprint(), c.fingerprint());
  }
}
