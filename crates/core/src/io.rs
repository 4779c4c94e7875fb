//! Reading and writing annotation files in the work directory.
//!
//! Layout, relative to the work directory:
//!
//! ```text
//! <file>/@text                    corpus text (raw bytes)
//! <file>/@structure               source-markup annotation list
//! <file>/<span-ref>/_span         span offsets, one `start\tend` per line
//! <file>/<span-ref>/<attr-ref>    attribute values, one per span
//! <corpus-ref>                    corpus-level opaque data
//! ```
//!
//! Attribute values are newline-framed with `\`-escaping so arbitrary byte
//! sequences round-trip exactly. Every write bumps the file mtime even when
//! nothing changed, keeping the scheduler's freshness checks monotone.

use std::fs;
use std::path::{Path, PathBuf};

use crate::model::Reference;
use crate::{Error, Result};

/// File name for span offsets inside a span-reference directory.
pub const SPAN_FILE: &str = "_span";

/// Corpus text of a source file.
pub const TEXT_FILE: &str = "@text";

/// List of annotations recovered from existing source markup.
pub const STRUCTURE_FILE: &str = "@structure";

/// A span: half-open byte interval into the corpus text.
pub type Span = (u64, u64);

/// Map a reference to its path below the work directory.
///
/// Span references live in `<file>/<name>/_span`, attributes in
/// `<file>/<name>/<attr>`. Corpus-level data (`file == None`) and `data`
/// annotations drop the span/attr split and use the reference name directly.
pub fn annotation_path(work_dir: &Path, file: Option<&str>, reference: &Reference, data: bool) -> PathBuf {
  let base = match file {
    Some(f) => work_dir.join(f),
    None => work_dir.to_path_buf(),
  };
  if data {
    return base.join(reference.as_str());
  }
  match reference.attribute() {
    Some(attr) => base.join(reference.name()).join(attr),
    None => base.join(reference.name()).join(SPAN_FILE),
  }
}

pub fn annotation_exists(work_dir: &Path, file: Option<&str>, reference: &Reference, data: bool) -> bool {
  annotation_path(work_dir, file, reference, data).exists()
}

/// Write span offsets for a span annotation. Spans must be sorted ascending.
pub fn write_spans(work_dir: &Path, file: &str, reference: &Reference, spans: &[Span]) -> Result<()> {
  for window in spans.windows(2) {
    if window[0] > window[1] {
      return Err(Error::User(format!(
        "annotation spans must be sorted: {:?} precedes {:?} in {reference}",
        window[0], window[1]
      )));
    }
  }
  let mut out = String::new();
  for (start, end) in spans {
    out.push_str(&format!("{start}\t{end}\n"));
  }
  write_bytes(&annotation_path(work_dir, Some(file), &reference.plain(), false), out.as_bytes())
}

pub fn read_spans(work_dir: &Path, file: &str, reference: &Reference) -> Result<Vec<Span>> {
  let path = annotation_path(work_dir, Some(file), &reference.plain(), false);
  let text = fs::read_to_string(&path)?;
  let mut spans = Vec::new();
  for line in text.lines() {
    let (start, end) = line
      .split_once('\t')
      .ok_or_else(|| Error::User(format!("malformed span file: {}", path.display())))?;
    let parse = |s: &str| {
      s.parse::<u64>()
        .map_err(|_| Error::User(format!("malformed span offset in {}", path.display())))
    };
    spans.push((parse(start)?, parse(end)?));
  }
  Ok(spans)
}

/// Write attribute values, one per span of the parent annotation.
pub fn write_values(work_dir: &Path, file: &str, reference: &Reference, values: &[String]) -> Result<()> {
  let attr = reference
    .attribute()
    .ok_or_else(|| Error::User(format!("'{reference}' is not an attribute reference")))?;
  let path = annotation_path(
    work_dir,
    Some(file),
    &Reference::new(format!("{}:{attr}", reference.name())),
    false,
  );
  let mut out = String::new();
  for value in values {
    out.push_str(&escape(value));
    out.push('\n');
  }
  write_bytes(&path, out.as_bytes())
}

pub fn read_values(work_dir: &Path, file: &str, reference: &Reference) -> Result<Vec<String>> {
  let path = annotation_path(work_dir, Some(file), reference, false);
  let text = fs::read_to_string(&path)?;
  text.lines().map(unescape).collect()
}

/// Number of entries in an annotation (spans or values).
pub fn annotation_size(work_dir: &Path, file: &str, reference: &Reference) -> Result<usize> {
  if reference.is_attribute() {
    Ok(read_values(work_dir, file, reference)?.len())
  } else {
    Ok(read_spans(work_dir, file, reference)?.len())
  }
}

/// Write opaque corpus-level or data-annotation bytes.
pub fn write_data(work_dir: &Path, file: Option<&str>, reference: &Reference, bytes: &[u8]) -> Result<()> {
  write_bytes(&annotation_path(work_dir, file, reference, true), bytes)
}

pub fn read_data(work_dir: &Path, file: Option<&str>, reference: &Reference) -> Result<Vec<u8>> {
  Ok(fs::read(annotation_path(work_dir, file, reference, true))?)
}

/// Write the corpus text of a source file.
pub fn write_text(work_dir: &Path, file: &str, text: &str) -> Result<()> {
  write_bytes(&work_dir.join(file).join(TEXT_FILE), text.as_bytes())
}

pub fn read_text(work_dir: &Path, file: &str) -> Result<String> {
  Ok(fs::read_to_string(work_dir.join(file).join(TEXT_FILE))?)
}

/// Record which annotations were recovered from the source markup.
pub fn write_structure(work_dir: &Path, file: &str, annotations: &[Reference]) -> Result<()> {
  let mut out = String::new();
  for reference in annotations {
    out.push_str(reference.as_str());
    out.push('\n');
  }
  write_bytes(&work_dir.join(file).join(STRUCTURE_FILE), out.as_bytes())
}

pub fn read_structure(work_dir: &Path, file: &str) -> Result<Vec<Reference>> {
  let text = fs::read_to_string(work_dir.join(file).join(STRUCTURE_FILE))?;
  Ok(text.lines().map(Reference::new).collect())
}

/// Read the text slices covered by a span annotation.
pub fn read_span_texts(work_dir: &Path, file: &str, reference: &Reference) -> Result<Vec<String>> {
  let text = read_text(work_dir, file)?;
  let spans = read_spans(work_dir, file, reference)?;
  spans
    .iter()
    .map(|&(start, end)| {
      text
        .get(start as usize..end as usize)
        .map(str::to_string)
        .ok_or_else(|| Error::User(format!("span {start}..{end} of {reference} outside corpus text")))
    })
    .collect()
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::write(path, bytes)?;
  // Touch so freshness holds even when the content is unchanged
  let now = std::time::SystemTime::now();
  let _ = fs::File::open(path).and_then(|f| f.set_modified(now));
  Ok(())
}

fn escape(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for c in value.chars() {
    match c {
      '\\' => out.push_str("\\\\"),
      '\n' => out.push_str("\\n"),
      '\r' => out.push_str("\\r"),
      _ => out.push(c),
    }
  }
  out
}

fn unescape(line: &str) -> Result<String> {
  let mut out = String::with_capacity(line.len());
  let mut chars = line.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      out.push(c);
      continue;
    }
    match chars.next() {
      Some('\\') => out.push('\\'),
      Some('n') => out.push('\n'),
      Some('r') => out.push('\r'),
      other => {
        return Err(Error::User(format!(
          "malformed escape '\\{}' in annotation value",
          other.map(String::from).unwrap_or_default()
        )));
      }
    }
  }
  Ok(out)
}
