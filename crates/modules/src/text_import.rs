//! Plain-text importer.

use std::sync::Arc;

use weft_core::Result;
use weft_core::exec::{Handler, JobContext};
use weft_core::model::{ProcessorInfo, ProcessorKind, Reference};
use weft_core::registry::ModuleSet;

pub fn module() -> ModuleSet {
  let info = ProcessorInfo {
    module: "text_import".into(),
    name: "parse".into(),
    kind: ProcessorKind::Importer,
    description: "Import plain text files.\n\nThe whole file becomes the corpus text; a single \
                  text_import.text span covers it."
      .into(),
    params: vec![],
    language: vec![],
    config: vec![],
    priority: 0,
    order: None,
    wildcards: vec![],
    preloader: None,
    file_extension: Some("txt".into()),
    import_outputs: vec![Reference::new("text_import.text")],
    text_annotation: Some(Reference::new("text_import.text")),
    is_abstract: false,
    uninstaller: None,
  };

  ModuleSet {
    name: "text_import".into(),
    description: "Import of plain text source files.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(info, Arc::new(TextImporter))],
  }
}

struct TextImporter;

impl Handler for TextImporter {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let text = std::fs::read_to_string(ctx.source_path("txt")?)?;
    let span = Reference::new("text_import.text");

    ctx.write_text(&text)?;
    ctx.write_spans(&span, &[(0, text.len() as u64)])?;
    ctx.write_structure(&[span])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use weft_core::io;

  #[test]
  fn test_import_covers_whole_file() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("source")).unwrap();
    std::fs::write(tmp.path().join("source/doc.txt"), "hej hopp").unwrap();

    let ctx = JobContext {
      rule: "text_import:parse".into(),
      file: Some("doc".into()),
      params: BTreeMap::new(),
      work_dir: tmp.path().join("staging"),
      input_dir: tmp.path().join("work"),
      export_dir: tmp.path().join("export-staging"),
      export_input_dir: tmp.path().join("export"),
      source_dir: tmp.path().join("source"),
      models_dir: None,
    };
    TextImporter.execute(&ctx).unwrap();

    assert_eq!(io::read_text(&ctx.work_dir, "doc").unwrap(), "hej hopp");
    assert_eq!(
      io::read_spans(&ctx.work_dir, "doc", &Reference::new("text_import.text")).unwrap(),
      vec![(0, 8)]
    );
  }
}
