//! CLI command implementations

mod admin;
mod inspect;
mod preload;
mod run;

pub use admin::{cmd_autocomplete, cmd_clean, cmd_plugins, cmd_schema, cmd_setup};
pub use inspect::{cmd_classes, cmd_config, cmd_files, cmd_languages, cmd_modules, cmd_presets, ModuleFilter};
pub use preload::{cmd_preload_start, cmd_preload_status, cmd_preload_stop};
pub use run::{cmd_build_models, cmd_create_file, cmd_install, cmd_run, cmd_run_rule, RunOptions};

use std::path::PathBuf;

use anyhow::{Context, Result};

use weft_core::dirs::Paths;
use weft_core::pipeline::Pipeline;

/// The corpus is always the current working directory.
pub(crate) fn corpus_dir() -> PathBuf {
  std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Prepare the engine for the current corpus with the built-in modules.
pub(crate) fn prepare_pipeline() -> Result<Pipeline> {
  let paths = Paths::new(corpus_dir());
  let arbiter = crate::arbiter::default_arbiter();
  Pipeline::prepare(paths, weft_modules::builtin_modules(), arbiter.as_ref()).context("could not prepare the pipeline")
}
