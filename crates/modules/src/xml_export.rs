//! Pretty-printed XML export.
//!
//! Combines the requested annotations of one source file into a nested XML
//! document. Span annotations become elements (named after their export
//! name or the last segment of the reference); attribute annotations become
//! XML attributes on their span's element.

use std::collections::BTreeMap;
use std::sync::Arc;

use quick_xml::escape::escape;
use tracing::debug;

use weft_core::exec::{ExportItem, Handler, JobContext};
use weft_core::model::{ParamRole, ParamSpec, ProcessorInfo, ProcessorKind, Reference, parse_annotation_list};
use weft_core::registry::ModuleSet;
use weft_core::{Error, Result};

pub fn module() -> ModuleSet {
  let pretty = ProcessorInfo {
    module: "xml_export".into(),
    name: "pretty".into(),
    kind: ProcessorKind::Exporter,
    description: "Export one pretty-printed XML file per source file.".into(),
    params: vec![
      ParamSpec::new("text", ParamRole::Text),
      ParamSpec::new(
        "annotations",
        ParamRole::ExportAnnotations {
          config_key: "export.annotations".into(),
          all_files: false,
        },
      ),
      ParamSpec::new(
        "source_annotations",
        ParamRole::SourceAnnotations {
          config_key: "export.source_annotations".into(),
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Export {
          path: "xml_export.pretty/{file}_export.xml".into(),
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
    name: "xml_export".into(),
    description: "XML rendering of annotated source files.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(pretty, Arc::new(PrettyXmlExporter))],
  }
}

struct PrettyXmlExporter;

impl Handler for PrettyXmlExporter {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let text = ctx.read_text()?;
    let items = ctx.export_items("annotations")?;

    // The source-annotation list is resolved here against this file's
    // structure annotations: `not` exclusions and `...` refer to what the
    // source actually contains. An unset key keeps everything, an
    // explicitly empty list keeps nothing.
    let structure = weft_core::io::read_structure(&ctx.input_dir, ctx.file.as_deref().unwrap_or_default())?;
    let source_items: Vec<ExportItem> = match ctx.strings("source_annotations")? {
      Some([]) => Vec::new(),
      raw => parse_annotation_list(raw.unwrap_or(&[]), Some(&structure), true)
        .into_iter()
        .filter(|(reference, _)| structure.contains(reference))
        .map(|(reference, export_name)| ExportItem { reference, export_name })
        .collect(),
    };

    let mut all_items: Vec<ExportItem> = items.to_vec();
    for item in source_items {
      if !all_items.iter().any(|i| i.reference == item.reference) {
        all_items.push(item);
      }
    }

    let elements = collect_elements(ctx, &all_items)?;
    let document = render(&text, elements);

    let out = ctx.string("out")?;
    std::fs::write(ctx.export_path(out)?, document)?;
    debug!(export = out, "wrote XML export");
    Ok(())
  }
}

struct Element {
  start: u64,
  end: u64,
  name: String,
  attrs: Vec<(String, String)>,
}

/// Read every span annotation with its attribute values as renderable
/// elements, ordered for nesting (outermost first at equal starts).
fn collect_elements(ctx: &JobContext, items: &[ExportItem]) -> Result<Vec<Element>> {
  // span reference -> (element name, attribute items)
  let mut spans: BTreeMap<String, (String, Vec<&ExportItem>)> = BTreeMap::new();
  for item in items {
    if item.reference.is_attribute() {
      continue;
    }
    let name = item
      .export_name
      .clone()
      .unwrap_or_else(|| short_name(item.reference.name()));
    spans.insert(item.reference.name().to_string(), (name, Vec::new()));
  }
  for item in items {
    if !item.reference.is_attribute() {
      continue;
    }
    let parent = item.reference.name().to_string();
    match spans.get_mut(&parent) {
      Some((_, attrs)) => attrs.push(item),
      None => {
        return Err(Error::User(format!(
          "attribute '{}' is exported without its span annotation '{parent}'",
          item.reference
        )));
      }
    }
  }

  let mut elements = Vec::new();
  for (span_name, (element_name, attr_items)) in &spans {
    let reference = Reference::new(span_name.clone());
    let offsets = ctx.read_spans(&reference)?;

    let mut attr_values: Vec<(String, Vec<String>)> = Vec::new();
    for item in attr_items {
      let attr_name = item
        .export_name
        .clone()
        .unwrap_or_else(|| short_name(item.reference.attribute().unwrap_or_default()));
      let values = ctx.read_values(&item.reference)?;
      if values.len() != offsets.len() {
        return Err(Error::User(format!(
          "attribute '{}' has {} values for {} spans",
          item.reference,
          values.len(),
          offsets.len()
        )));
      }
      attr_values.push((attr_name, values));
    }

    for (index, (start, end)) in offsets.iter().enumerate() {
      let attrs = attr_values
        .iter()
        .filter(|(_, values)| !values[index].is_empty())
        .map(|(name, values)| (name.clone(), values[index].clone()))
        .collect();
      elements.push(Element {
        start: *start,
        end: *end,
        name: element_name.clone(),
        attrs,
      });
    }
  }

  // Outer elements before inner ones so the stack nesting works
  elements.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
  Ok(elements)
}

/// Serialize nested elements with two-space indentation.
fn render(text: &str, elements: Vec<Element>) -> String {
  let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
  let mut open: Vec<(u64, String)> = Vec::new();
  let mut cursor = 0u64;

  let flush_text = |out: &mut String, from: u64, to: u64, depth: usize| {
    let slice = text.get(from as usize..to as usize).unwrap_or("");
    let trimmed = slice.trim();
    if !trimmed.is_empty() {
      out.push_str(&"  ".repeat(depth));
      out.push_str(&escape(trimmed));
      out.push('\n');
    }
  };

  for element in elements {
    // Close every open element ending at or before this start
    while let Some((end, _)) = open.last() {
      if *end <= element.start {
        let (end, name) = open.pop().unwrap_or_default();
        flush_text(&mut out, cursor, end, open.len() + 1);
        cursor = end;
        out.push_str(&"  ".repeat(open.len()));
        out.push_str(&format!("</{name}>\n"));
      } else {
        break;
      }
    }

    flush_text(&mut out, cursor, element.start, open.len());
    cursor = element.start;

    out.push_str(&"  ".repeat(open.len()));
    out.push('<');
    out.push_str(&element.name);
    for (attr, value) in &element.attrs {
      out.push_str(&format!(" {attr}=\"{}\"", escape(value)));
    }
    out.push_str(">\n");
    open.push((element.end, element.name));
  }

  while let Some((end, name)) = open.pop() {
    flush_text(&mut out, cursor, end, open.len() + 1);
    cursor = end;
    out.push_str(&"  ".repeat(open.len()));
    out.push_str(&format!("</{name}>\n"));
  }

  out
}

fn short_name(reference_part: &str) -> String {
  reference_part
    .rsplit('.')
    .next()
    .unwrap_or(reference_part)
    .to_string()
}
