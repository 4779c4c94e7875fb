//! Generic utility annotators.

use std::sync::Arc;

use weft_core::Result;
use weft_core::exec::{Handler, JobContext};
use weft_core::model::{
  ParamRole, ParamSpec, ProcessorInfo, ProcessorKind, Reference, WildcardKind, WildcardSpec,
};
use weft_core::registry::ModuleSet;

pub fn module() -> ModuleSet {
  let number_position = ProcessorInfo {
    module: "misc".into(),
    name: "number_position".into(),
    kind: ProcessorKind::Annotator,
    description: "Number the spans of any annotation by position.".into(),
    params: vec![
      ParamSpec::new(
        "spans",
        ParamRole::Input {
          reference: Reference::new("{annotation}"),
          all_files: false,
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Output {
          reference: Reference::new("{annotation}:misc.number_position"),
          cls: None,
          description: Some("Position numbers (1-based)".into()),
          data: false,
          common: false,
        },
      ),
    ],
    language: vec![],
    config: vec![],
    priority: 0,
    order: None,
    wildcards: vec![WildcardSpec {
      name: "annotation".into(),
      kind: WildcardKind::Annotation,
    }],
    preloader: None,
    file_extension: None,
    import_outputs: vec![],
    text_annotation: None,
    is_abstract: false,
    uninstaller: None,
  };

  let mut id = number_position.clone();
  id.name = "id".into();
  id.description = "Stable identifiers for the spans of any annotation.".into();
  id.params = vec![
    ParamSpec::new(
      "spans",
      ParamRole::Input {
        reference: Reference::new("{annotation}"),
        all_files: false,
      },
    ),
    ParamSpec::new("source_file", ParamRole::SourceFilename),
    ParamSpec::new(
      "out",
      ParamRole::Output {
        reference: Reference::new("{annotation}:misc.id"),
        cls: None,
        description: Some("Identifiers unique within the corpus".into()),
        data: false,
        common: false,
      },
    ),
  ];

  ModuleSet {
    name: "misc".into(),
    description: "Utility annotations usable with any span annotation.".into(),
    language: vec![],
    config: vec![],
    processors: vec![
      (number_position, Arc::new(NumberByPosition)),
      (id, Arc::new(SpanIds)),
    ],
  }
}

struct NumberByPosition;

impl Handler for NumberByPosition {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let spans = ctx.annotation("spans")?.clone();
    let out = ctx.annotation("out")?.clone();
    let count = ctx.read_spans(&spans)?.len();
    let values: Vec<String> = (1..=count).map(|n| n.to_string()).collect();
    ctx.write_values(&out, &values)
  }
}

struct SpanIds;

impl Handler for SpanIds {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let spans = ctx.annotation("spans")?.clone();
    let out = ctx.annotation("out")?.clone();
    let file = ctx.string("source_file")?.replace('/', "-");
    let values: Vec<String> = ctx
      .read_spans(&spans)?
      .iter()
      .enumerate()
      .map(|(i, _)| format!("{file}-{}-{i}", spans.name()))
      .collect();
    ctx.write_values(&out, &values)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use weft_core::exec::ParamValue;
  use weft_core::io;

  #[test]
  fn test_number_by_position() {
    let tmp = tempfile::tempdir().unwrap();
    let work = tmp.path().join("work");
    io::write_spans(&work, "doc", &Reference::new("segment.sentence"), &[(0, 3), (4, 9)]).unwrap();

    let ctx = JobContext {
      rule: "misc:number_position".into(),
      file: Some("doc".into()),
      params: BTreeMap::from([
        ("spans".to_string(), ParamValue::Annotation(Reference::new("segment.sentence"))),
        (
          "out".to_string(),
          ParamValue::Annotation(Reference::new("segment.sentence:misc.number_position")),
        ),
      ]),
      work_dir: work.clone(),
      input_dir: work.clone(),
      export_dir: tmp.path().join("export"),
      export_input_dir: tmp.path().join("export"),
      source_dir: tmp.path().join("source"),
      models_dir: None,
    };
    NumberByPosition.execute(&ctx).unwrap();

    assert_eq!(
      io::read_values(&work, "doc", &Reference::new("segment.sentence:misc.number_position")).unwrap(),
      vec!["1", "2"]
    );
  }
}
