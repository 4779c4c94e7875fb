//! Administrative commands: setup, clean, plugins, schema, autocomplete.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use weft_core::config::{ConfigStore, schema};
use weft_core::dirs::{self, Paths};
use weft_core::registry::Registry;

/// `weft setup [--dir PATH] [--reset]`: record the data directory and
/// create its skeleton.
pub fn cmd_setup(dir: Option<PathBuf>, reset: bool) -> Result<()> {
  let config_file = dirs::user_config_file().context("no user config directory available")?;

  if reset {
    if config_file.exists() {
      std::fs::remove_file(&config_file)?;
    }
    println!("data directory setting removed");
    return Ok(());
  }

  let data_dir = match dir {
    Some(dir) => dir,
    None => match std::env::var(dirs::DATADIR_ENV) {
      Ok(dir) => PathBuf::from(dir),
      Err(_) => bail!("pass --dir PATH (or set {}) to choose a data directory", dirs::DATADIR_ENV),
    },
  };

  for subdir in ["models", "bin", "config/presets"] {
    std::fs::create_dir_all(data_dir.join(subdir))?;
  }

  if let Some(parent) = config_file.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(&config_file, format!("data_dir: {}\n", data_dir.display()))?;

  println!("data directory set to {}", data_dir.display());
  Ok(())
}

/// `weft clean [--all] [--export] [--logs]`. Always destructive, never asks.
pub fn cmd_clean(all: bool, export: bool, logs: bool) -> Result<()> {
  let paths = Paths::new(super::corpus_dir());

  let mut victims = vec![paths.work_dir()];
  if all || export {
    victims.push(paths.export_dir());
  }
  if all || logs {
    victims.push(paths.log_dir());
  }

  for victim in victims {
    match std::fs::remove_dir_all(&victim) {
      Ok(()) => println!("removed {}", victim.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => return Err(e).context(format!("could not remove {}", victim.display())),
    }
  }
  Ok(())
}

/// `weft plugins install|uninstall|list`.
///
/// Plugins are Rust crates compiled into the binary by embedders; the
/// registration file only tracks which ones the user asked for, so listings
/// and future builds can pick them up.
pub fn cmd_plugins(action: &str, name: Option<&str>) -> Result<()> {
  let paths = Paths::new(super::corpus_dir());
  let Some(data_dir) = paths.data_dir.clone() else {
    bail!("no data directory configured; run 'weft setup' first");
  };
  let registry_file = data_dir.join("plugins.yaml");

  let mut plugins: Vec<String> = std::fs::read_to_string(&registry_file)
    .ok()
    .and_then(|text| serde_yaml::from_str(&text).ok())
    .unwrap_or_default();

  match (action, name) {
    ("list", _) => {
      if plugins.is_empty() {
        println!("no plugins registered");
      }
      for plugin in &plugins {
        println!("{plugin}");
      }
      return Ok(());
    }
    ("install", Some(name)) => {
      if !valid_plugin_name(name) {
        bail!(
          "invalid plugin name '{name}': expected a lowercase namespace prefix, an underscore, \
           and one or more letters, digits or underscores"
        );
      }
      if !plugins.iter().any(|p| p == name) {
        plugins.push(name.to_string());
        plugins.sort();
      }
      println!("registered plugin '{name}'");
    }
    ("uninstall", Some(name)) => {
      let before = plugins.len();
      plugins.retain(|p| p != name);
      if plugins.len() == before {
        bail!("plugin '{name}' is not registered");
      }
      println!("unregistered plugin '{name}'");
    }
    _ => bail!("plugin action needs a plugin name"),
  }

  std::fs::write(&registry_file, serde_yaml::to_string(&plugins)?)?;
  Ok(())
}

fn valid_plugin_name(name: &str) -> bool {
  let mut parts = name.splitn(2, '_');
  let (Some(prefix), Some(rest)) = (parts.next(), parts.next()) else {
    return false;
  };
  prefix.len() >= 2
    && prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    && prefix.chars().next().is_some_and(|c| c.is_ascii_lowercase())
    && !rest.is_empty()
    && !rest.ends_with('_')
    && rest.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// `weft schema`: JSON schema over every declared config key.
pub fn cmd_schema() -> Result<()> {
  let mut config = ConfigStore::empty();
  Registry::discover(weft_modules::builtin_modules(), &mut config)?;
  println!("{}", serde_json::to_string_pretty(&schema::generate(&config))?);
  Ok(())
}

/// `weft autocomplete`: refresh the completion cache under the data dir and
/// print the bash snippet that uses it.
pub fn cmd_autocomplete() -> Result<()> {
  let paths = Paths::new(super::corpus_dir());
  let mut config = ConfigStore::empty();
  let registry = Registry::discover(weft_modules::builtin_modules(), &mut config)?;

  let mut words: Vec<String> = [
    "run", "install", "uninstall", "clean", "config", "files", "modules", "presets", "classes", "languages", "setup",
    "build-models", "plugins", "run-rule", "create-file", "preload", "autocomplete", "schema",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect();
  words.extend(registry.processors().map(|p| p.info.id()));

  if let Some(cache) = paths.autocomplete_cache() {
    if let Some(parent) = cache.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&cache, words.join("\n") + "\n")?;
    println!("# completion cache refreshed: {}", cache.display());
  }

  println!("complete -W \"{}\" weft", words.join(" "));
  Ok(())
}
