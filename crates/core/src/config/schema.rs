//! JSON-schema generation and validation for the configuration.
//!
//! The schema is generated from the declared key structure; validation
//! checks both the shape (sections must be mappings) and the per-value
//! constraints of each [`ConfigKeySpec`] (type, choices, min/max, pattern).

use regex::Regex;
use serde_json::{Map, Value as Json, json};
use serde_yaml::Value as Yaml;

use super::ConfigStore;
use crate::model::{ConfigKeySpec, DataType};
use crate::{Error, Result};

/// Generate a JSON Schema document for every declared configuration key.
pub fn generate(store: &ConfigStore) -> Json {
  let mut root = Map::new();
  root.insert("$schema".into(), json!("https://json-schema.org/draft/2020-12/schema"));
  root.insert("title".into(), json!("weft corpus configuration"));
  root.insert("type".into(), json!("object"));

  let mut properties = Map::new();
  for spec in store.declared_keys() {
    insert_key(&mut properties, &spec.name, leaf_schema(spec));
  }
  root.insert("properties".into(), Json::Object(properties));
  Json::Object(root)
}

fn insert_key(properties: &mut Map<String, Json>, dotted: &str, leaf: Json) {
  match dotted.split_once('.') {
    None => {
      properties.insert(dotted.to_string(), leaf);
    }
    Some((head, rest)) => {
      let section = properties
        .entry(head.to_string())
        .or_insert_with(|| json!({"type": "object", "properties": {}}));
      let nested = section
        .as_object_mut()
        .and_then(|o| o.get_mut("properties"))
        .and_then(Json::as_object_mut);
      if let Some(nested) = nested {
        insert_key(nested, rest, leaf);
      }
    }
  }
}

fn leaf_schema(spec: &ConfigKeySpec) -> Json {
  let mut leaf = Map::new();
  leaf.insert("description".into(), json!(spec.description));
  let ty = match spec.datatype {
    DataType::Str => "string",
    DataType::Int => "integer",
    DataType::Float => "number",
    DataType::Bool => "boolean",
    DataType::List => "array",
    DataType::Map => "object",
  };
  leaf.insert("type".into(), json!(ty));
  if !spec.choices.is_empty() {
    leaf.insert("enum".into(), json!(spec.choices));
  }
  if let Some(min) = spec.min {
    leaf.insert("minimum".into(), json!(min));
  }
  if let Some(max) = spec.max {
    leaf.insert("maximum".into(), json!(max));
  }
  if let Some(pattern) = &spec.pattern {
    leaf.insert("pattern".into(), json!(pattern));
  }
  if let Some(default) = &spec.default
    && let Ok(default) = serde_json::to_value(default)
  {
    leaf.insert("default".into(), default);
  }
  Json::Object(leaf)
}

/// Validate the loaded configuration against every declared constraint.
/// All violations are collected into one `ConfigInvalid` error.
pub fn validate(store: &ConfigStore) -> Result<()> {
  let mut problems: Vec<String> = Vec::new();

  for spec in store.declared_keys() {
    let Some(value) = store.get(&spec.name) else { continue };
    check_value(spec, value, &mut problems);
  }

  if problems.is_empty() {
    Ok(())
  } else {
    Err(Error::ConfigInvalid(problems.join("; ")))
  }
}

fn check_value(spec: &ConfigKeySpec, value: &Yaml, problems: &mut Vec<String>) {
  let key = &spec.name;
  let type_ok = match spec.datatype {
    DataType::Str => value.is_string(),
    DataType::Int => value.is_i64() || value.is_u64(),
    DataType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
    DataType::Bool => value.is_bool(),
    DataType::List => value.is_sequence(),
    DataType::Map => value.is_mapping(),
  };
  if !type_ok {
    problems.push(format!("'{key}' must be of type {:?}", spec.datatype));
    return;
  }

  if !spec.choices.is_empty()
    && let Some(s) = value.as_str()
    && !spec.choices.iter().any(|c| c == s)
  {
    problems.push(format!("'{key}' must be one of {}", spec.choices.join(", ")));
  }

  if let Some(n) = value.as_f64().or_else(|| value.as_i64().map(|i| i as f64)) {
    if spec.min.is_some_and(|min| n < min) {
      problems.push(format!("'{key}' must be >= {}", spec.min.unwrap()));
    }
    if spec.max.is_some_and(|max| n > max) {
      problems.push(format!("'{key}' must be <= {}", spec.max.unwrap()));
    }
  }

  if let Some(pattern) = &spec.pattern
    && let Some(s) = value.as_str()
  {
    match Regex::new(pattern) {
      Ok(re) if !re.is_match(s) => problems.push(format!("'{key}' must match pattern {pattern}")),
      Err(_) => problems.push(format!("'{key}' has an invalid validation pattern")),
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store_with(spec: ConfigKeySpec, yaml: &str) -> ConfigStore {
    let mut store = ConfigStore::from_yaml(yaml).unwrap();
    store.declare(spec, "test:module").unwrap();
    store
  }

  #[test]
  fn test_generate_nests_dotted_keys() {
    let store = store_with(
      ConfigKeySpec::new("segment.model", "Segmenter model").with_datatype(DataType::Str),
      "",
    );
    let schema = generate(&store);
    let leaf = &schema["properties"]["segment"]["properties"]["model"];
    assert_eq!(leaf["type"], "string");
    assert_eq!(leaf["description"], "Segmenter model");
  }

  #[test]
  fn test_validate_type_mismatch() {
    let mut spec = ConfigKeySpec::new("seg.threads", "Thread cap");
    spec.datatype = DataType::Int;
    let store = store_with(spec, "seg:\n  threads: many\n");
    assert!(matches!(validate(&store).unwrap_err(), Error::ConfigInvalid(_)));
  }

  #[test]
  fn test_validate_choices_and_range() {
    let mut choice_spec = ConfigKeySpec::new("xml.mode", "Export mode");
    choice_spec.choices = vec!["pretty".into(), "compact".into()];
    let store = store_with(choice_spec.clone(), "xml:\n  mode: pretty\n");
    assert!(validate(&store).is_ok());
    let store = store_with(choice_spec, "xml:\n  mode: sideways\n");
    assert!(validate(&store).is_err());

    let mut range_spec = ConfigKeySpec::new("seg.threads", "Thread cap");
    range_spec.datatype = DataType::Int;
    range_spec.min = Some(1.0);
    range_spec.max = Some(64.0);
    let store = store_with(range_spec, "seg:\n  threads: 0\n");
    assert!(validate(&store).is_err());
  }

  #[test]
  fn test_validate_pattern() {
    let mut spec = ConfigKeySpec::new("korp.table_name", "Database table name");
    spec.pattern = Some("^[a-z0-9-]+$".into());
    let store = store_with(spec.clone(), "korp:\n  table_name: my-corpus\n");
    assert!(validate(&store).is_ok());
    let store = store_with(spec, "korp:\n  table_name: 'My Corpus'\n");
    assert!(validate(&store).is_err());
  }

  #[test]
  fn test_unset_keys_are_not_validated() {
    let mut spec = ConfigKeySpec::new("seg.threads", "Thread cap");
    spec.datatype = DataType::Int;
    let store = store_with(spec, "");
    assert!(validate(&store).is_ok());
  }
}
