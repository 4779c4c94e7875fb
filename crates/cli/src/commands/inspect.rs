//! Introspection commands: config, files, modules, presets, classes,
//! languages.

use anyhow::Result;

use weft_core::config::presets::PresetLibrary;
use weft_core::model::ProcessorKind;

/// `weft config [KEY]`
pub fn cmd_config(key: Option<&str>) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;

  match key {
    Some(key) => {
      match pipeline.config.get(key) {
        Some(value) => print!("{}", serde_yaml::to_string(value)?),
        None => println!("(unset)"),
      }
      if let Some(spec) = pipeline.config.spec(key) {
        println!("# {}", spec.description);
      }
      let consumers = pipeline.config.usage_of(key);
      if !consumers.is_empty() {
        println!("# used by: {}", consumers.join(", "));
      }
    }
    None => print!("{}", serde_yaml::to_string(pipeline.config.values())?),
  }
  Ok(())
}

/// `weft files`
pub fn cmd_files() -> Result<()> {
  let pipeline = super::prepare_pipeline()?;
  for file in &pipeline.source_files {
    println!("{file}");
  }
  Ok(())
}

#[derive(Default)]
pub struct ModuleFilter {
  pub annotators: bool,
  pub importers: bool,
  pub exporters: bool,
}

impl ModuleFilter {
  fn accepts(&self, kind: ProcessorKind) -> bool {
    if !(self.annotators || self.importers || self.exporters) {
      return true;
    }
    matches!(
      (kind, self),
      (ProcessorKind::Annotator, ModuleFilter { annotators: true, .. })
        | (ProcessorKind::Importer, ModuleFilter { importers: true, .. })
        | (ProcessorKind::Exporter, ModuleFilter { exporters: true, .. })
    )
  }
}

/// `weft modules [--annotators|--importers|--exporters]`
pub fn cmd_modules(filter: ModuleFilter) -> Result<()> {
  let pipeline = super::prepare_pipeline()?;

  for module in pipeline.registry.modules() {
    let processors: Vec<_> = pipeline
      .registry
      .processors()
      .filter(|p| p.info.module == module.name && filter.accepts(p.info.kind))
      .collect();
    if processors.is_empty() {
      continue;
    }

    println!("{}  -  {}", module.name, module.description);
    for processor in processors {
      println!("  {:<32} [{}] {}", processor.info.id(), processor.info.kind.as_str(), processor.info.summary());
    }
    println!();
  }
  Ok(())
}

/// `weft presets`
pub fn cmd_presets() -> Result<()> {
  let pipeline = super::prepare_pipeline()?;
  let Some(presets_dir) = pipeline.paths.presets_dir() else {
    println!("no data directory configured; run 'weft setup' first");
    return Ok(());
  };
  let library = PresetLibrary::load(&presets_dir, pipeline.config.language(), pipeline.config.variety())?;

  let mut empty = true;
  for name in library.names() {
    empty = false;
    println!("{name}");
    for member in library.members(name).unwrap_or_default() {
      println!("  {member}");
    }
  }
  if empty {
    println!("no presets available for language '{}'", pipeline.config.language());
  }
  Ok(())
}

/// `weft classes`
pub fn cmd_classes() -> Result<()> {
  let pipeline = super::prepare_pipeline()?;
  for (class, annotation) in &pipeline.classes {
    println!("<{class}>  ->  {annotation}");
  }
  Ok(())
}

/// `weft languages`
pub fn cmd_languages() -> Result<()> {
  let pipeline = super::prepare_pipeline()?;
  let mut languages: Vec<_> = pipeline.registry.languages().collect();
  languages.sort();
  if languages.is_empty() {
    println!("all registered processors are language-independent");
  }
  for language in languages {
    println!("{language}");
  }
  Ok(())
}
