//! Directory identities used by the engine.
//!
//! Four roots matter: the **data** directory (models, default configs,
//! presets, binaries), the **corpus** directory (config + source files), the
//! **work** directory (intermediate annotation files, relative to the corpus)
//! and the **export** directory (final outputs, relative to the corpus).

use std::path::PathBuf;
#[cfg(test)]
use std::path::Path;

/// Environment variable overriding the configured data directory.
pub const DATADIR_ENV: &str = "WEFT_DATADIR";

/// Name of the corpus configuration file.
pub const CONFIG_FILE: &str = "config.yaml";

/// Work directory name, relative to the corpus directory.
pub const WORK_DIR: &str = "weft-workdir";

/// Export directory name, relative to the corpus directory.
pub const EXPORT_DIR: &str = "export";

/// Source directory name, relative to the corpus directory.
pub const SOURCE_DIR: &str = "source";

/// Log directory name, relative to the corpus directory.
pub const LOG_DIR: &str = "logs";

/// Directory for persisted interactive decisions, relative to the corpus.
pub const DECISIONS_DIR: &str = ".weft";

/// Resolved directory layout for one engine run.
#[derive(Debug, Clone)]
pub struct Paths {
  /// Data directory holding models, default config, presets and `bin/`.
  pub data_dir: Option<PathBuf>,
  /// Corpus directory (the current working corpus).
  pub corpus_dir: PathBuf,
}

impl Paths {
  /// Resolve paths for a corpus directory, honouring the data-dir override
  /// from the environment and falling back to the user config file.
  pub fn new(corpus_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: resolve_data_dir(),
      corpus_dir: corpus_dir.into(),
    }
  }

  /// Construct with an explicit data directory (used by `weft setup` and tests).
  pub fn with_data_dir(corpus_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: Some(data_dir.into()),
      corpus_dir: corpus_dir.into(),
    }
  }

  pub fn work_dir(&self) -> PathBuf {
    self.corpus_dir.join(WORK_DIR)
  }

  pub fn export_dir(&self) -> PathBuf {
    self.corpus_dir.join(EXPORT_DIR)
  }

  pub fn source_dir(&self) -> PathBuf {
    self.corpus_dir.join(SOURCE_DIR)
  }

  pub fn log_dir(&self) -> PathBuf {
    self.corpus_dir.join(LOG_DIR)
  }

  pub fn config_file(&self) -> PathBuf {
    self.corpus_dir.join(CONFIG_FILE)
  }

  /// File remembering interactive arbitration decisions for this corpus.
  pub fn decisions_file(&self) -> PathBuf {
    self.corpus_dir.join(DECISIONS_DIR).join("decisions.yaml")
  }

  pub fn models_dir(&self) -> Option<PathBuf> {
    self.data_dir.as_ref().map(|d| d.join("models"))
  }

  pub fn bin_dir(&self) -> Option<PathBuf> {
    self.data_dir.as_ref().map(|d| d.join("bin"))
  }

  pub fn presets_dir(&self) -> Option<PathBuf> {
    self.data_dir.as_ref().map(|d| d.join("config").join("presets"))
  }

  /// Data-directory default config, merged below the corpus config.
  pub fn default_config_file(&self) -> Option<PathBuf> {
    self.data_dir.as_ref().map(|d| d.join("config").join("config_default.yaml"))
  }

  /// Autocompletion cache, kept under the data directory.
  pub fn autocomplete_cache(&self) -> Option<PathBuf> {
    self.data_dir.as_ref().map(|d| d.join("autocomplete"))
  }

  /// Locate a binary: regular `PATH` lookup first, then the data dir's `bin/`.
  pub fn find_binary(&self, name: &str) -> Option<PathBuf> {
    if let Some(found) = search_path(name) {
      return Some(found);
    }
    let candidate = self.bin_dir()?.join(name);
    candidate.is_file().then_some(candidate)
  }
}

/// Default socket path for the preloader, scoped to the current user.
pub fn default_socket_path() -> PathBuf {
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    PathBuf::from(runtime_dir).join("weft-preload.sock")
  } else {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/weft-preload-{uid}.sock"))
  }
}

/// User config file recording the chosen data directory (`weft setup`).
pub fn user_config_file() -> Option<PathBuf> {
  dirs::config_dir().map(|d| d.join("weft").join("config.yaml"))
}

fn resolve_data_dir() -> Option<PathBuf> {
  if let Ok(dir) = std::env::var(DATADIR_ENV) {
    return Some(PathBuf::from(dir));
  }

  // Fall back to the location recorded by `weft setup`
  let config_file = user_config_file()?;
  let text = std::fs::read_to_string(config_file).ok()?;
  let value: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
  value
    .get("data_dir")
    .and_then(|v| v.as_str())
    .map(PathBuf::from)
}

fn search_path(name: &str) -> Option<PathBuf> {
  let path_var = std::env::var_os("PATH")?;
  for dir in std::env::split_paths(&path_var) {
    let candidate = dir.join(name);
    if candidate.is_file() {
      return Some(candidate);
    }
  }
  None
}
