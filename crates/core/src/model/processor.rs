//! Processor metadata.
//!
//! A processor is described entirely by an explicit [`ProcessorInfo`]
//! descriptor: its kind, its role-tagged parameter list, the configuration
//! keys it declares, its wildcards and its preloader hooks. Descriptors are
//! created at discovery time and read-only thereafter; the rule compiler
//! consumes them to materialise concrete rules.

use serde::{Deserialize, Serialize};

use super::reference::Reference;

/// The six kinds of processors the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
  Annotator,
  Importer,
  Exporter,
  Installer,
  Uninstaller,
  Modelbuilder,
}

impl ProcessorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Annotator => "annotator",
      Self::Importer => "importer",
      Self::Exporter => "exporter",
      Self::Installer => "installer",
      Self::Uninstaller => "uninstaller",
      Self::Modelbuilder => "modelbuilder",
    }
  }
}

/// Role tag carried by a processor parameter's default. Tagged variants keep
/// every rule-compiler branch statically exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum ParamRole {
  /// Annotation read by the processor.
  Input {
    reference: Reference,
    /// Read this annotation for every source file (corpus-level consumers).
    #[serde(default)]
    all_files: bool,
  },
  /// Annotation written by the processor.
  Output {
    reference: Reference,
    /// Class this output is the canonical producer of (e.g. `token`).
    #[serde(default)]
    cls: Option<String>,
    #[serde(default)]
    description: Option<String>,
    /// Opaque corpus-level data rather than a per-file span/attr pair.
    #[serde(default)]
    data: bool,
    /// Corpus-level (no `{file}` segment in the work path).
    #[serde(default)]
    common: bool,
  },
  /// The annotation list named by a config key (e.g. `export.annotations`),
  /// read as inputs by exporters.
  ExportAnnotations {
    config_key: String,
    #[serde(default)]
    all_files: bool,
  },
  /// Source-markup annotation list named by a config key; not a dependency.
  SourceAnnotations { config_key: String },
  /// Plain configuration value.
  Config {
    key: String,
    #[serde(default)]
    default: Option<serde_yaml::Value>,
  },
  /// Model file under the data directory (input).
  Model { name: Reference },
  /// Model file produced by a modelbuilder.
  ModelOutput { name: Reference },
  /// External binary, looked up through `PATH` then the data dir `bin/`.
  Binary { name: String },
  /// The corpus source directory.
  Source,
  /// Name of the source file the job runs on.
  SourceFilename,
  /// Names of all source files in the corpus.
  AllSourceFilenames,
  /// The corpus text of the current source file (`@text`).
  Text,
  /// The corpus identifier (`metadata.id`).
  Corpus,
  /// The corpus language code.
  Language,
  /// Export output path pattern, relative to the export directory.
  Export { path: String },
  /// Existing export consumed as input.
  ExportInput {
    path: String,
    #[serde(default)]
    all_files: bool,
  },
  /// Zero-length sentinel written by installers/uninstallers on success.
  Marker { reference: Reference },
  /// A marker referenced without triggering its producer.
  MarkerOptional { reference: Reference },
  /// Untyped scalar with a literal default.
  Scalar {
    #[serde(default)]
    value: serde_yaml::Value,
  },
}

/// One formal parameter of a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
  pub name: String,
  pub role: ParamRole,
  /// Optional parameters resolve to nothing instead of suppressing the rule
  /// when their reference cannot be expanded.
  #[serde(default)]
  pub optional: bool,
  /// The parameter takes a list of values.
  #[serde(default)]
  pub is_list: bool,
}

impl ParamSpec {
  pub fn new(name: impl Into<String>, role: ParamRole) -> Self {
    Self {
      name: name.into(),
      role,
      optional: false,
      is_list: false,
    }
  }

  pub fn optional(mut self) -> Self {
    self.optional = true;
    self
  }

  pub fn list(mut self) -> Self {
    self.is_list = true;
    self
  }
}

/// Nominal data type of a declared configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  #[default]
  Str,
  Int,
  Float,
  Bool,
  List,
  Map,
}

/// A configuration key declared by a processor or module, with validation
/// constraints used for schema generation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigKeySpec {
  pub name: String,
  pub description: String,
  #[serde(default)]
  pub default: Option<serde_yaml::Value>,
  #[serde(default)]
  pub datatype: DataType,
  #[serde(default)]
  pub choices: Vec<String>,
  #[serde(default)]
  pub min: Option<f64>,
  #[serde(default)]
  pub max: Option<f64>,
  /// Regex the (string) value must match.
  #[serde(default)]
  pub pattern: Option<String>,
}

impl ConfigKeySpec {
  pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      description: description.into(),
      ..Default::default()
    }
  }

  pub fn with_default(mut self, default: serde_yaml::Value) -> Self {
    self.default = Some(default);
    self
  }

  pub fn with_datatype(mut self, datatype: DataType) -> Self {
    self.datatype = datatype;
    self
  }
}

/// Type tag for a declared wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WildcardKind {
  /// Binds a span reference.
  Annotation,
  /// Binds an attribute name.
  Attribute,
  /// Free-form string.
  Other,
}

/// A wildcard carried by a processor, e.g. `{annotation}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WildcardSpec {
  pub name: String,
  pub kind: WildcardKind,
}

/// Preloader hooks declared by a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloaderSpec {
  /// Parameter names passed to the preload hook (and hashed into the
  /// preloader fingerprint).
  pub params: Vec<String>,
  /// Parameter receiving the warm state when the job runs preloaded.
  pub target: String,
  /// One warm state shared across all workers of this processor.
  pub shared: bool,
  /// Run the cleanup hook after every job.
  pub cleanup: bool,
}

/// Full metadata descriptor for one processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorInfo {
  /// Owning module, e.g. `segment`.
  pub module: String,
  /// Function name within the module, e.g. `tokenize`.
  pub name: String,
  pub kind: ProcessorKind,
  /// First line is the short summary; an optional long form follows after a
  /// blank line.
  pub description: String,
  pub params: Vec<ParamSpec>,
  /// Supported languages; empty means all.
  #[serde(default)]
  pub language: Vec<String>,
  /// Configuration keys declared by this processor.
  #[serde(default)]
  pub config: Vec<ConfigKeySpec>,
  /// Scheduling hint; higher runs earlier when several jobs are runnable.
  #[serde(default)]
  pub priority: i32,
  /// Producer-conflict rank; lower wins. Absent means lowest preference.
  #[serde(default)]
  pub order: Option<i32>,
  #[serde(default)]
  pub wildcards: Vec<WildcardSpec>,
  #[serde(default)]
  pub preloader: Option<PreloaderSpec>,
  /// (importer) Extension of the source files this importer handles.
  #[serde(default)]
  pub file_extension: Option<String>,
  /// (importer) Annotations the importer guarantees to generate.
  #[serde(default)]
  pub import_outputs: Vec<Reference>,
  /// (importer) Output that seeds `classes.text` unless set manually.
  #[serde(default)]
  pub text_annotation: Option<Reference>,
  /// (exporter) Produces no files itself; only triggers its inputs.
  #[serde(default)]
  pub is_abstract: bool,
  /// (installer) Name of the related uninstaller.
  #[serde(default)]
  pub uninstaller: Option<String>,
}

impl ProcessorInfo {
  /// Stable identifier: `<module>:<function>`.
  pub fn id(&self) -> String {
    format!("{}:{}", self.module, self.name)
  }

  /// First line of the description.
  pub fn summary(&self) -> &str {
    self.description.lines().next().unwrap_or_default()
  }

  /// Output parameters, in declaration order.
  pub fn outputs(&self) -> impl Iterator<Item = (&ParamSpec, &Reference)> {
    self.params.iter().filter_map(|p| match &p.role {
      ParamRole::Output { reference, .. } => Some((p, reference)),
      ParamRole::Marker { reference } => Some((p, reference)),
      ParamRole::ModelOutput { name } => Some((p, name)),
      _ => None,
    })
  }

  /// Marker outputs only (installer/uninstaller sentinels).
  pub fn markers(&self) -> impl Iterator<Item = &Reference> {
    self.params.iter().filter_map(|p| match &p.role {
      ParamRole::Marker { reference } => Some(reference),
      _ => None,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn minimal_info() -> ProcessorInfo {
    ProcessorInfo {
      module: "segment".into(),
      name: "tokenize".into(),
      kind: ProcessorKind::Annotator,
      description: "Tokenize text.\n\nLonger form.".into(),
      params: vec![ParamSpec::new(
        "out",
        ParamRole::Output {
          reference: Reference::new("segment.token"),
          cls: Some("token".into()),
          description: None,
          data: false,
          common: false,
        },
      )],
      language: vec![],
      config: vec![],
      priority: 0,
      order: None,
      wildcards: vec![],
      preloader: None,
      file_extension: None,
      import_outputs: vec![],
      text_annotation: None,
      is_abstract: false,
      uninstaller: None,
    }
  }

  #[test]
  fn test_id_and_summary() {
    let info = minimal_info();
    assert_eq!(info.id(), "segment:tokenize");
    assert_eq!(info.summary(), "Tokenize text.");
  }

  #[test]
  fn test_outputs_iterator() {
    let info = minimal_info();
    let outputs: Vec<_> = info.outputs().collect();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].1.as_str(), "segment.token");
  }

  #[test]
  fn test_param_role_serde_tagging() {
    let role = ParamRole::Config {
      key: "segment.model".into(),
      default: None,
    };
    let json = serde_json::to_value(&role).unwrap();
    assert_eq!(json["role"], "config");
    assert_eq!(json["key"], "segment.model");
  }
}
