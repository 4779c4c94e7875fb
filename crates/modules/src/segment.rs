//! Unicode segmentation (UAX #29 sentence and word boundaries).

use std::sync::Arc;

use unicode_segmentation::UnicodeSegmentation;

use weft_core::Result;
use weft_core::exec::{Handler, JobContext};
use weft_core::io::Span;
use weft_core::model::{ParamRole, ParamSpec, ProcessorInfo, ProcessorKind, Reference};
use weft_core::registry::ModuleSet;

pub fn module() -> ModuleSet {
  let sentences = ProcessorInfo {
    module: "segment".into(),
    name: "sentences".into(),
    kind: ProcessorKind::Annotator,
    description: "Split text chunks into sentences.".into(),
    params: vec![
      ParamSpec::new("text", ParamRole::Text),
      ParamSpec::new(
        "chunk",
        ParamRole::Input {
          reference: Reference::new("<text>"),
          all_files: false,
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Output {
          reference: Reference::new("segment.sentence"),
          cls: Some("sentence".into()),
          description: Some("Sentence segments".into()),
          data: false,
          common: false,
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

  let mut tokenize = sentences.clone();
  tokenize.name = "tokenize".into();
  tokenize.description = "Split sentences into word tokens.".into();
  tokenize.params = vec![
    ParamSpec::new("text", ParamRole::Text),
    ParamSpec::new(
      "sentences",
      ParamRole::Input {
        reference: Reference::new("<sentence>"),
        all_files: false,
      },
    ),
    ParamSpec::new(
      "out",
      ParamRole::Output {
        reference: Reference::new("segment.token"),
        cls: Some("token".into()),
        description: Some("Word tokens".into()),
        data: false,
        common: false,
      },
    ),
  ];

  ModuleSet {
    name: "segment".into(),
    description: "Sentence and token segmentation.".into(),
    language: vec![],
    config: vec![],
    processors: vec![
      (sentences, Arc::new(SentenceSegmenter)),
      (tokenize, Arc::new(Tokenizer)),
    ],
  }
}

struct SentenceSegmenter;

impl Handler for SentenceSegmenter {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let text = ctx.read_text()?;
    let chunk = ctx.annotation("chunk")?.clone();
    let out = ctx.annotation("out")?.clone();

    let mut spans: Vec<Span> = Vec::new();
    for (chunk_start, chunk_end) in ctx.read_spans(&chunk)? {
      let slice = slice_of(&text, chunk_start, chunk_end);
      for (offset, sentence) in slice.split_sentence_bound_indices() {
        let trimmed = sentence.trim_end();
        if trimmed.trim().is_empty() {
          continue;
        }
        let start = chunk_start + offset as u64;
        spans.push((start, start + trimmed.len() as u64));
      }
    }
    spans.sort_unstable();
    ctx.write_spans(&out, &spans)
  }
}

struct Tokenizer;

impl Handler for Tokenizer {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let text = ctx.read_text()?;
    let sentences = ctx.annotation("sentences")?.clone();
    let out = ctx.annotation("out")?.clone();

    let mut spans: Vec<Span> = Vec::new();
    for (sent_start, sent_end) in ctx.read_spans(&sentences)? {
      let slice = slice_of(&text, sent_start, sent_end);
      for (offset, word) in slice.unicode_word_indices() {
        let start = sent_start + offset as u64;
        spans.push((start, start + word.len() as u64));
      }
    }
    spans.sort_unstable();
    ctx.write_spans(&out, &spans)
  }
}

fn slice_of(text: &str, start: u64, end: u64) -> &str {
  text.get(start as usize..end as usize).unwrap_or("")
}
