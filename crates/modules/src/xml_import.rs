//! XML importer.
//!
//! Extracts the corpus text from an XML source file and turns every element
//! into a span annotation (`xml.<element>`), with attributes as
//! `xml.<element>:xml.<attribute>`. Span offsets index into the extracted
//! text, which is the concatenation of all text nodes in document order.

use std::collections::BTreeMap;
use std::sync::Arc;

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::debug;

use weft_core::exec::{Handler, JobContext};
use weft_core::io::Span;
use weft_core::model::{ConfigKeySpec, ProcessorInfo, ProcessorKind, Reference};
use weft_core::registry::ModuleSet;
use weft_core::{Error, Result};

pub fn module() -> ModuleSet {
  let info = ProcessorInfo {
    module: "xml_import".into(),
    name: "parse".into(),
    kind: ProcessorKind::Importer,
    description: "Import XML source files.\n\nElements become span annotations prefixed with \
                  'xml.'; attributes become span attributes. The element named by \
                  xml_import.text_element carries the corpus text."
      .into(),
    params: vec![],
    language: vec![],
    config: vec![ConfigKeySpec::new(
      "xml_import.text_element",
      "Element whose annotation is guaranteed by the importer",
    )
    .with_default(serde_yaml::Value::String("text".into()))],
    priority: 0,
    order: None,
    wildcards: vec![],
    preloader: None,
    file_extension: Some("xml".into()),
    import_outputs: vec![Reference::new("xml.[xml_import.text_element]")],
    text_annotation: Some(Reference::new("xml.[xml_import.text_element]")),
    is_abstract: false,
    uninstaller: None,
  };

  ModuleSet {
    name: "xml_import".into(),
    description: "Import of XML source files.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(info, Arc::new(XmlImporter))],
  }
}

struct XmlImporter;

impl Handler for XmlImporter {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let source = std::fs::read_to_string(ctx.source_path("xml")?)?;
    let parsed = parse(&source).map_err(|e| Error::User(format!("could not parse XML source: {e}")))?;

    ctx.write_text(&parsed.text)?;

    let mut produced = Vec::new();
    for (element, occurrences) in &parsed.elements {
      let span_ref = Reference::new(format!("xml.{element}"));
      let mut sorted: Vec<&Occurrence> = occurrences.iter().collect();
      sorted.sort_by_key(|o| o.span);
      let spans: Vec<Span> = sorted.iter().map(|o| o.span).collect();
      ctx.write_spans(&span_ref, &spans)?;
      produced.push(span_ref.clone());

      // One value file per attribute; elements without the attribute get
      // an empty value
      let mut attr_names: Vec<&String> = sorted.iter().flat_map(|o| o.attrs.keys()).collect();
      attr_names.sort();
      attr_names.dedup();
      for attr in attr_names {
        let attr_ref = Reference::new(format!("xml.{element}:xml.{attr}"));
        let values: Vec<String> = sorted
          .iter()
          .map(|o| o.attrs.get(attr).cloned().unwrap_or_default())
          .collect();
        ctx.write_values(&attr_ref, &values)?;
        produced.push(attr_ref);
      }
    }

    ctx.write_structure(&produced)?;
    debug!(annotations = produced.len(), "imported XML markup");
    Ok(())
  }
}

struct Occurrence {
  span: Span,
  attrs: BTreeMap<String, String>,
}

struct Parsed {
  text: String,
  elements: BTreeMap<String, Vec<Occurrence>>,
}

fn parse(source: &str) -> std::result::Result<Parsed, quick_xml::Error> {
  let mut reader = Reader::from_str(source);

  let mut text = String::new();
  let mut elements: BTreeMap<String, Vec<Occurrence>> = BTreeMap::new();
  let mut stack: Vec<(String, u64, BTreeMap<String, String>)> = Vec::new();

  loop {
    match reader.read_event()? {
      Event::Start(start) => {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let attrs = read_attrs(&start)?;
        stack.push((name, text.len() as u64, attrs));
      }
      Event::Empty(start) => {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let attrs = read_attrs(&start)?;
        let offset = text.len() as u64;
        elements.entry(name).or_default().push(Occurrence {
          span: (offset, offset),
          attrs,
        });
      }
      Event::End(_) => {
        if let Some((name, start, attrs)) = stack.pop() {
          elements.entry(name).or_default().push(Occurrence {
            span: (start, text.len() as u64),
            attrs,
          });
        }
      }
      Event::Text(t) => {
        text.push_str(&t.unescape()?);
      }
      Event::CData(t) => {
        text.push_str(&String::from_utf8_lossy(&t));
      }
      Event::Eof => break,
      _ => {}
    }
  }

  Ok(Parsed { text, elements })
}

fn read_attrs(start: &quick_xml::events::BytesStart<'_>) -> std::result::Result<BTreeMap<String, String>, quick_xml::Error> {
  let mut attrs = BTreeMap::new();
  for attr in start.attributes() {
    let attr = attr.map_err(quick_xml::Error::from)?;
    let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
    let value = attr.unescape_value()?.into_owned();
    attrs.insert(key, value);
  }
  Ok(attrs)
}
