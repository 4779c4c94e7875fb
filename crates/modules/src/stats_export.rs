//! Corpus-level frequency list export.

use std::collections::BTreeMap;
use std::sync::Arc;

use weft_core::Result;
use weft_core::exec::{Handler, JobContext};
use weft_core::model::{ParamRole, ParamSpec, ProcessorInfo, ProcessorKind};
use weft_core::registry::ModuleSet;

pub fn module() -> ModuleSet {
  let freq = ProcessorInfo {
    module: "stats_export".into(),
    name: "freq".into(),
    kind: ProcessorKind::Exporter,
    description: "Export a tab-separated frequency list over all source files.".into(),
    params: vec![
      ParamSpec::new("files", ParamRole::AllSourceFilenames),
      ParamSpec::new(
        "annotations",
        ParamRole::ExportAnnotations {
          config_key: "export.annotations".into(),
          all_files: true,
        },
      ),
      ParamSpec::new("corpus", ParamRole::Corpus),
      ParamSpec::new(
        "out",
        ParamRole::Export {
          path: "stats_export.freq/frequencies.tsv".into(),
        },
      ),
    ],
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
  };

  ModuleSet {
    name: "stats_export".into(),
    description: "Frequency statistics over the whole corpus.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(freq, Arc::new(FrequencyExporter))],
  }
}

struct FrequencyExporter;

impl Handler for FrequencyExporter {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let files = ctx.files("files")?;
    let items = ctx.export_items("annotations")?;
    let corpus = ctx.string("corpus")?;

    // annotation -> surface text -> count
    let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
    for item in items {
      if item.reference.is_attribute() {
        continue;
      }
      let per_annotation = counts.entry(item.reference.as_str().to_string()).or_default();
      for file in files {
        let text = ctx.read_text_of(file)?;
        for (start, end) in ctx.read_spans_of(file, &item.reference)? {
          let surface = text.get(start as usize..end as usize).unwrap_or("");
          *per_annotation.entry(surface.to_string()).or_default() += 1;
        }
      }
    }

    let mut lines = vec![format!("# corpus: {corpus}")];
    for (annotation, surfaces) in &counts {
      let mut sorted: Vec<(&String, &u64)> = surfaces.iter().collect();
      sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
      for (surface, count) in sorted {
        lines.push(format!("{annotation}\t{surface}\t{count}"));
      }
    }

    let out = ctx.string("out")?;
    std::fs::write(ctx.export_path(out)?, lines.join("\n") + "\n")?;
    Ok(())
  }
}
