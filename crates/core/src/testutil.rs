//! Shared fixtures for unit tests.

use std::sync::Arc;

use crate::exec::{Handler, JobContext};
use crate::model::{ParamRole, ParamSpec, ProcessorInfo, ProcessorKind, Reference};
use crate::registry::ModuleSet;
use crate::Result;

struct NoopHandler;

impl Handler for NoopHandler {
  fn execute(&self, _ctx: &JobContext) -> Result<()> {
    Ok(())
  }
}

pub fn noop_handler() -> Arc<dyn Handler> {
  Arc::new(NoopHandler)
}

/// A minimal annotator descriptor with one output parameter.
pub fn annotator_info(module: &str, name: &str, output: &str, cls: Option<&str>) -> ProcessorInfo {
  ProcessorInfo {
    module: module.into(),
    name: name.into(),
    kind: ProcessorKind::Annotator,
    description: format!("Produce {output}."),
    params: vec![ParamSpec::new(
      "out",
      ParamRole::Output {
        reference: Reference::new(output),
        cls: cls.map(str::to_string),
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

/// A module wrapping the given processor descriptors with no-op bodies.
pub fn module_with(name: &str, infos: Vec<ProcessorInfo>) -> ModuleSet {
  ModuleSet {
    name: name.into(),
    description: format!("The {name} module."),
    language: vec![],
    config: vec![],
    processors: infos.into_iter().map(|info| (info, noop_handler())).collect(),
  }
}

/// A module with one single-output annotator.
pub fn annotator_module(module: &str, outputs: &[(&str, Option<&str>)]) -> ModuleSet {
  let infos = outputs
    .iter()
    .enumerate()
    .map(|(i, (output, cls))| annotator_info(module, &format!("annotate{i}"), output, *cls))
    .collect();
  module_with(module, infos)
}

pub fn input_param(name: &str, reference: &str) -> ParamSpec {
  ParamSpec::new(
    name,
    ParamRole::Input {
      reference: Reference::new(reference),
      all_files: false,
    },
  )
}

pub fn output_param(name: &str, reference: &str, cls: Option<&str>) -> ParamSpec {
  ParamSpec::new(
    name,
    ParamRole::Output {
      reference: Reference::new(reference),
      cls: cls.map(str::to_string),
      description: None,
      data: false,
      common: false,
    },
  )
}

/// An annotator with explicit parameters.
pub fn processor_info(module: &str, name: &str, kind: ProcessorKind, params: Vec<ParamSpec>) -> ProcessorInfo {
  ProcessorInfo {
    module: module.into(),
    name: name.into(),
    kind,
    description: format!("The {module}:{name} processor."),
    params,
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
