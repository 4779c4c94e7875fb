//! Language filtering.
//!
//! Processors may declare the languages they support as ISO 639-3 codes with
//! an optional variety suffix (`swe`, `ekk-formal`). The corpus declares its
//! language in `metadata.language` and optionally `metadata.variety`.

/// Check whether the corpus language is covered by a processor's declared
/// language list. An empty list means all languages; the pseudo-language
/// `__all__` on the corpus side matches everything.
pub fn check_language(corpus_lang: &str, langs: &[String], corpus_variety: Option<&str>) -> bool {
  if langs.is_empty() || corpus_lang == "__all__" {
    return true;
  }

  let full = match corpus_variety {
    Some(variety) if !variety.is_empty() => format!("{corpus_lang}-{variety}"),
    _ => corpus_lang.to_string(),
  };
  let base = full.split('-').next().unwrap_or(&full);

  langs.iter().any(|l| l == &full || l == base)
}
