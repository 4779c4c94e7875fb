//! Wordlist model: a model builder plus a preloadable lookup annotator.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use weft_core::exec::{Bindings, Handler, JobContext, ParamValue, WarmState};
use weft_core::model::{
  ConfigKeySpec, DataType, ParamRole, ParamSpec, PreloaderSpec, ProcessorInfo, ProcessorKind, Reference,
};
use weft_core::registry::ModuleSet;
use weft_core::{Error, Result};

pub fn module() -> ModuleSet {
  let compile = ProcessorInfo {
    module: "wordlist".into(),
    name: "compile".into(),
    kind: ProcessorKind::Modelbuilder,
    description: "Compile the configured word list into a model file.".into(),
    params: vec![
      ParamSpec::new(
        "entries",
        ParamRole::Config {
          key: "wordlist.entries".into(),
          default: None,
        },
      ),
      ParamSpec::new(
        "model",
        ParamRole::ModelOutput {
          name: Reference::new("wordlist/entries.txt"),
        },
      ),
    ],
    language: vec![],
    config: vec![
      ConfigKeySpec::new("wordlist.entries", "Words included in the compiled model").with_datatype(DataType::List),
    ],
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

  let lookup = ProcessorInfo {
    module: "wordlist".into(),
    name: "lookup".into(),
    kind: ProcessorKind::Annotator,
    description: "Mark tokens that occur in the word list model.\n\nThe model is loaded once per \
                  worker when run under the preloader."
      .into(),
    params: vec![
      ParamSpec::new(
        "token",
        ParamRole::Input {
          reference: Reference::new("<token>"),
          all_files: false,
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Output {
          reference: Reference::new("<token>:wordlist.known"),
          cls: None,
          description: Some("'y' for tokens found in the word list".into()),
          data: false,
          common: false,
        },
      ),
      ParamSpec::new(
        "model",
        ParamRole::Model {
          name: Reference::new("wordlist/entries.txt"),
        },
      ),
    ],
    language: vec![],
    config: vec![],
    priority: 0,
    order: None,
    wildcards: vec![],
    preloader: Some(PreloaderSpec {
      params: vec!["model".into()],
      target: "model".into(),
      shared: true,
      cleanup: false,
    }),
    file_extension: None,
    import_outputs: vec![],
    text_annotation: None,
    is_abstract: false,
    uninstaller: None,
  };

  ModuleSet {
    name: "wordlist".into(),
    description: "Word list model and lookup annotation.".into(),
    language: vec![],
    config: vec![],
    processors: vec![(compile, Arc::new(CompileWordlist)), (lookup, Arc::new(LookupWordlist))],
  }
}

struct CompileWordlist;

impl Handler for CompileWordlist {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let entries: BTreeSet<String> = match ctx.scalar("entries") {
      Ok(value) => value
        .as_sequence()
        .map(|items| {
          items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_lowercase()))
            .collect()
        })
        .unwrap_or_default(),
      Err(_) => BTreeSet::new(),
    };

    let model = ctx.path("model")?;
    if let Some(parent) = model.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for entry in &entries {
      content.push_str(entry);
      content.push('\n');
    }
    std::fs::write(model, content)?;
    debug!(entries = entries.len(), "wordlist model written");
    Ok(())
  }
}

struct LookupWordlist;

fn load_model(path: &std::path::Path) -> Result<BTreeSet<String>> {
  let content = std::fs::read_to_string(path)
    .map_err(|e| Error::User(format!("could not read wordlist model {}: {e}", path.display())))?;
  Ok(content.lines().map(str::to_string).collect())
}

impl LookupWordlist {
  fn annotate(&self, ctx: &JobContext, words: &BTreeSet<String>) -> Result<()> {
    let token = ctx.annotation("token")?.clone();
    let out = ctx.annotation("out")?.clone();
    let values: Vec<String> = ctx
      .read_span_texts(&token)?
      .iter()
      .map(|t| if words.contains(&t.to_lowercase()) { "y" } else { "n" }.to_string())
      .collect();
    ctx.write_values(&out, &values)
  }
}

impl Handler for LookupWordlist {
  fn execute(&self, ctx: &JobContext) -> Result<()> {
    let words = load_model(ctx.path("model")?)?;
    self.annotate(ctx, &words)
  }

  fn preload(&self, params: &Bindings) -> Result<WarmState> {
    let Some(ParamValue::Path(path)) = params.get("model") else {
      return Err(Error::User("wordlist preloader needs the 'model' binding".into()));
    };
    Ok(Box::new(load_model(path)?))
  }

  fn execute_preloaded(&self, ctx: &JobContext, warm: &mut WarmState) -> Result<()> {
    match warm.downcast_ref::<BTreeSet<String>>() {
      Some(words) => self.annotate(ctx, words),
      None => self.execute(ctx),
    }
  }
}
