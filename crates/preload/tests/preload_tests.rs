//! End-to-end preloader tests: server and scheduler talk over a real
//! Unix socket in a temp directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use weft_core::dirs::Paths;
use weft_core::exec::{Bindings, Handler, JobContext, ParamValue, WarmState};
use weft_core::model::{ParamRole, ParamSpec, PreloaderSpec, ProcessorInfo, ProcessorKind, Reference};
use weft_core::pipeline::Pipeline;
use weft_core::registry::ModuleSet;
use weft_core::resolve::NoArbiter;
use weft_core::schedule::RunnerOptions;
use weft_preload::{PreloadClient, PreloadServer, ServerConfig};

// ============================================================================
// Fixture processors
// ============================================================================

struct TxtImporter;

impl Handler for TxtImporter {
  fn execute(&self, ctx: &JobContext) -> weft_core::Result<()> {
    let text = std::fs::read_to_string(ctx.source_path("txt")?)?;
    ctx.write_text(&text)?;
    ctx.write_structure(&[])?;
    Ok(())
  }
}

struct WhitespaceTokenizer;

impl Handler for WhitespaceTokenizer {
  fn execute(&self, ctx: &JobContext) -> weft_core::Result<()> {
    let text = ctx.read_text()?;
    let out = ctx.annotation("out")?.clone();
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
      if c.is_whitespace() {
        if let Some(s) = start.take() {
          spans.push((s as u64, i as u64));
        }
      } else if start.is_none() {
        start = Some(i);
      }
    }
    if let Some(s) = start {
      spans.push((s as u64, text.len() as u64));
    }
    ctx.write_spans(&out, &spans)?;
    Ok(())
  }
}

/// A tagger whose warm state is the "loaded model" name; cold runs write
/// `cold:*` values so tests can tell the paths apart.
struct ModelTagger;

impl Handler for ModelTagger {
  fn execute(&self, ctx: &JobContext) -> weft_core::Result<()> {
    self.tag(ctx, "cold")
  }

  fn preload(&self, params: &Bindings) -> weft_core::Result<WarmState> {
    let model = match params.get("model") {
      Some(ParamValue::Str(model)) => model.clone(),
      _ => return Err(weft_core::Error::User("tagger.model is not bound".into())),
    };
    Ok(Box::new(format!("loaded-{model}")))
  }

  fn execute_preloaded(&self, ctx: &JobContext, warm: &mut WarmState) -> weft_core::Result<()> {
    let model = warm
      .downcast_ref::<String>()
      .map(String::as_str)
      .unwrap_or("bad-state");
    self.tag(ctx, &format!("warm:{model}"))
  }
}

impl ModelTagger {
  fn tag(&self, ctx: &JobContext, mode: &str) -> weft_core::Result<()> {
    let token = ctx.annotation("token")?.clone();
    let out = ctx.annotation("out")?.clone();
    let count = ctx.read_spans(&token)?.len();
    let values = vec![mode.to_string(); count];
    ctx.write_values(&out, &values)
  }
}

fn modules() -> Vec<ModuleSet> {
  let mut importer = ProcessorInfo {
    module: "txt_import".into(),
    name: "parse".into(),
    kind: ProcessorKind::Importer,
    description: "Plain text importer.".into(),
    params: vec![],
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
  importer.file_extension = Some("txt".into());

  let mut tokenizer = importer.clone();
  tokenizer.module = "segment".into();
  tokenizer.name = "tokenize".into();
  tokenizer.kind = ProcessorKind::Annotator;
  tokenizer.description = "Whitespace tokenizer.".into();
  tokenizer.file_extension = None;
  tokenizer.params = vec![
    ParamSpec::new("text", ParamRole::Text),
    ParamSpec::new(
      "out",
      ParamRole::Output {
        reference: Reference::new("segment.token"),
        cls: Some("token".into()),
        description: None,
        data: false,
        common: false,
      },
    ),
  ];

  let mut tagger = tokenizer.clone();
  tagger.module = "tagger".into();
  tagger.name = "tag".into();
  tagger.description = "Model-backed tagger.".into();
  tagger.params = vec![
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
        reference: Reference::new("<token>:tagger.tag"),
        cls: None,
        description: None,
        data: false,
        common: false,
      },
    ),
    ParamSpec::new(
      "model",
      ParamRole::Config {
        key: "tagger.model".into(),
        default: None,
      },
    ),
  ];
  tagger.config = vec![weft_core::model::ConfigKeySpec::new("tagger.model", "Model identifier")];
  tagger.preloader = Some(PreloaderSpec {
    params: vec!["model".into()],
    target: "model".into(),
    shared: false,
    cleanup: false,
  });

  vec![
    ModuleSet {
      name: "txt_import".into(),
      description: "Plain text import.".into(),
      language: vec![],
      config: vec![],
      processors: vec![(importer, Arc::new(TxtImporter))],
    },
    ModuleSet {
      name: "segment".into(),
      description: "Segmentation.".into(),
      language: vec![],
      config: vec![],
      processors: vec![(tokenizer, Arc::new(WhitespaceTokenizer))],
    },
    ModuleSet {
      name: "tagger".into(),
      description: "Tagging.".into(),
      language: vec![],
      config: vec![],
      processors: vec![(tagger, Arc::new(ModelTagger))],
    },
  ]
}

fn corpus(dir: &Path, model: &str) {
  std::fs::create_dir_all(dir.join("source")).unwrap();
  std::fs::write(
    dir.join("config.yaml"),
    format!(
      "metadata:\n  id: test\n  language: swe\nimport:\n  importer: txt_import:parse\ntagger:\n  model: {model}\npreload:\n  - tagger:tag\n"
    ),
  )
  .unwrap();
  std::fs::write(dir.join("source/doc.txt"), "ett par ord").unwrap();
}

fn prepare(dir: &Path) -> Pipeline {
  Pipeline::prepare(Paths::with_data_dir(dir, dir.join("data")), modules(), &NoArbiter).unwrap()
}

async fn start_server(pipeline: &Pipeline, socket: &Path) -> (tokio::task::JoinHandle<weft_core::Result<()>>, CancellationToken) {
  let server = Arc::new(
    PreloadServer::prepare(
      pipeline,
      ServerConfig {
        socket_path: socket.to_path_buf(),
        processes: 2,
      },
    )
    .unwrap(),
  );
  let cancel = CancellationToken::new();
  let handle = tokio::spawn(server.run(cancel.clone()));

  for _ in 0..50 {
    if socket.exists() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
  assert!(socket.exists(), "preloader socket did not appear");
  (handle, cancel)
}

fn tag_values(pipeline: &Pipeline) -> Vec<String> {
  weft_core::io::read_values(
    &pipeline.paths.work_dir(),
    "doc",
    &Reference::new("segment.token:tagger.tag"),
  )
  .unwrap()
}

const TARGET: &str = "weft-workdir/doc/segment.token/tagger.tag";

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_jobs_run_on_warm_workers() {
  let tmp = tempfile::tempdir().unwrap();
  corpus(tmp.path(), "model-a");
  let pipeline = prepare(tmp.path());
  let socket = tmp.path().join("preload.sock");
  let (handle, cancel) = start_server(&pipeline, &socket).await;

  let client = Arc::new(PreloadClient::connect(&socket).await.unwrap());
  assert!(client.preloaded().contains_key("tagger:tag"));

  let report = pipeline
    .run(
      &[TARGET.to_string()],
      RunnerOptions::default(),
      Some(client),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert!(report.is_success());
  assert_eq!(tag_values(&pipeline), vec!["warm:loaded-model-a"; 3]);

  let status = PreloadClient::status(&socket).await.unwrap();
  assert_eq!(status.jobs_served, 1);

  assert!(PreloadClient::stop(&socket).await.unwrap());
  let _ = handle.await.unwrap();
  assert!(!socket.exists());
  drop(cancel);
}

#[tokio::test]
async fn test_fingerprint_mismatch_falls_back_locally() {
  let server_dir = tempfile::tempdir().unwrap();
  corpus(server_dir.path(), "model-a");
  let server_pipeline = prepare(server_dir.path());
  let socket = server_dir.path().join("preload.sock");
  let (handle, cancel) = start_server(&server_pipeline, &socket).await;

  // A second corpus binds the tagger to a different model
  let corpus_dir = tempfile::tempdir().unwrap();
  corpus(corpus_dir.path(), "model-b");
  let pipeline = prepare(corpus_dir.path());

  let client = Arc::new(PreloadClient::connect(&socket).await.unwrap());
  let report = pipeline
    .run(
      &[TARGET.to_string()],
      RunnerOptions::default(),
      Some(client),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  // the run completes, but locally
  assert!(report.is_success());
  assert_eq!(tag_values(&pipeline), vec!["cold"; 3]);
  let status = PreloadClient::status(&socket).await.unwrap();
  assert_eq!(status.jobs_served, 0);

  cancel.cancel();
  let _ = handle.await.unwrap();
}

#[tokio::test]
async fn test_stop_without_server() {
  let tmp = tempfile::tempdir().unwrap();
  let stopped = PreloadClient::stop(&tmp.path().join("nope.sock")).await.unwrap();
  assert!(!stopped);
}

#[tokio::test]
async fn test_server_requires_preload_config() {
  let tmp = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(tmp.path().join("source")).unwrap();
  std::fs::write(
    tmp.path().join("config.yaml"),
    "metadata:\n  id: test\nimport:\n  importer: txt_import:parse\ntagger:\n  model: m\n",
  )
  .unwrap();
  let pipeline = prepare(tmp.path());
  let result = PreloadServer::prepare(
    &pipeline,
    ServerConfig {
      socket_path: tmp.path().join("s.sock"),
      processes: 1,
    },
  );
  assert!(result.is_err());
}
