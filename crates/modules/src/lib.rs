//! Built-in processor modules.
//!
//! These are the processors shipped with the engine: importers for XML and
//! plain text, a Unicode segmenter, a handful of generic annotators, XML
//! and frequency-list exporters, a copy-based installer pair and a wordlist
//! model builder. Plugins register additional [`ModuleSet`]s next to these.

use weft_core::registry::ModuleSet;

pub mod misc;
pub mod segment;
pub mod stats_export;
pub mod text_import;
pub mod wordlist;
pub mod xml_export;
pub mod xml_import;
pub mod xml_install;

/// Every built-in module, in registration order.
pub fn builtin_modules() -> Vec<ModuleSet> {
  vec![
    text_import::module(),
    xml_import::module(),
    segment::module(),
    misc::module(),
    wordlist::module(),
    xml_export::module(),
    stats_export::module(),
    xml_install::module(),
  ]
}
