use super::*;
use crate::config::ConfigStore;
use crate::dirs::Paths;
use crate::model::{ParamSpec, ProcessorInfo, ProcessorKind, WildcardKind, WildcardSpec};
use crate::registry::{ModuleSet, Registry};
use crate::resolve::{Decisions, NoArbiter, Resolver};
use crate::testutil::{input_param, module_with, output_param, processor_info};

/// Compile the given modules against a YAML config.
fn compile_rules(yaml: &str, modules: Vec<ModuleSet>, files: &[&str]) -> Result<(RuleSet, Decisions)> {
  let mut config = ConfigStore::from_yaml(yaml)?;
  let registry = Registry::discover(modules, &mut config)?;
  config.freeze();
  let mut decisions = Decisions::default();
  let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter)?;
  let paths = Paths::with_data_dir("/corpus", "/data");
  let source_files: Vec<String> = files.iter().map(|f| f.to_string()).collect();
  let compiler = Compiler {
    config: &config,
    registry: &registry,
    resolver: &resolver,
    paths: &paths,
    source_files: &source_files,
  };
  let rules = compiler.compile(&mut decisions, &NoArbiter)?;
  Ok((rules, decisions))
}

fn tokenizer(order: Option<i32>) -> ProcessorInfo {
  let mut info = processor_info(
    "segment",
    "tokenize",
    ProcessorKind::Annotator,
    vec![output_param("out", "segment.token", Some("token"))],
  );
  info.order = order;
  info
}

#[test]
fn test_basic_rule_patterns() {
  let info = processor_info(
    "saldo",
    "annotate",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:saldo.baseform", None),
    ],
  );
  let (rules, _) = compile_rules(
    "",
    vec![module_with("segment", vec![tokenizer(None)]), module_with("saldo", vec![info])],
    &["doc"],
  )
  .unwrap();

  let rule = rules.get("saldo:annotate").unwrap();
  assert!(rule.per_file);
  assert_eq!(rule.inputs, vec![PathPattern::new("weft-workdir/{file}/segment.token/_span")]);
  assert_eq!(rule.outputs, vec![PathPattern::new("weft-workdir/{file}/segment.token/saldo.baseform")]);
  assert_eq!(
    rule.params.get("out"),
    Some(&ParamValue::Annotation(Reference::new("segment.token:saldo.baseform")))
  );
}

#[test]
fn test_missing_config_suppresses_rule() {
  let info = processor_info(
    "wsd",
    "annotate",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:wsd.[wsd.model]", None),
    ],
  );
  let (rules, _) = compile_rules("", vec![module_with("segment", vec![tokenizer(None)]), module_with("wsd", vec![info])], &["doc"]).unwrap();
  assert!(rules.get("wsd:annotate").is_none());
  assert!(rules.get("segment:tokenize").is_some());
}

#[test]
fn test_conflict_ordering_by_order() {
  let first = tokenizer(Some(1));
  let mut second = tokenizer(Some(2));
  second.name = "tokenize_fallback".into();
  let (rules, _) = compile_rules("", vec![module_with("segment", vec![first, second])], &["doc"]).unwrap();

  let producers = rules.find_producers("weft-workdir/doc/segment.token/_span");
  assert_eq!(producers.len(), 2);
  assert_eq!(producers[0].0.id, "segment:tokenize");
  assert_eq!(producers[1].0.id, "segment:tokenize_fallback");
  assert!(rules
    .orderings()
    .contains(&("segment:tokenize".to_string(), "segment:tokenize_fallback".to_string())));
}

#[test]
fn test_equal_order_conflict_fails() {
  let first = tokenizer(Some(1));
  let mut second = tokenizer(Some(1));
  second.name = "tokenize_alt".into();
  let err = compile_rules("", vec![module_with("segment", vec![first, second])], &["doc"]).unwrap_err();
  assert!(matches!(err, Error::ProducerConflict { .. }));
}

#[test]
fn test_equal_order_conflict_resolved_by_decision() {
  let first = tokenizer(Some(1));
  let mut second = tokenizer(Some(1));
  second.name = "tokenize_alt".into();

  // seed the remembered decision by compiling through an arbiter
  struct PickSecond;
  impl Arbiter for PickSecond {
    fn choose(&self, _prompt: &str, _options: &[String]) -> Option<usize> {
      Some(1)
    }
  }

  let mut config = ConfigStore::from_yaml("").unwrap();
  let registry = Registry::discover(vec![module_with("segment", vec![first, second])], &mut config).unwrap();
  config.freeze();
  let mut decisions = Decisions::default();
  let resolver = Resolver::new(&config, &registry, &mut decisions, &NoArbiter).unwrap();
  let paths = Paths::with_data_dir("/corpus", "/data");
  let files = vec!["doc".to_string()];
  let compiler = Compiler {
    config: &config,
    registry: &registry,
    resolver: &resolver,
    paths: &paths,
    source_files: &files,
  };

  let rules = compiler.compile(&mut decisions, &PickSecond).unwrap();
  assert!(rules
    .orderings()
    .contains(&("segment:tokenize_alt".to_string(), "segment:tokenize".to_string())));
  assert_eq!(decisions.orders.len(), 1);

  // producer lookup follows the decision, not the alphabetical tiebreak
  let producers = rules.find_producers("weft-workdir/doc/segment.token/_span");
  assert_eq!(producers[0].0.id, "segment:tokenize_alt");
  assert_eq!(producers[1].0.id, "segment:tokenize");

  // the remembered decision now works without an arbiter
  let rules = compiler.compile(&mut decisions, &NoArbiter).unwrap();
  assert!(rules
    .orderings()
    .contains(&("segment:tokenize_alt".to_string(), "segment:tokenize".to_string())));
  let producers = rules.find_producers("weft-workdir/doc/segment.token/_span");
  assert_eq!(producers[0].0.id, "segment:tokenize_alt");
}

#[test]
fn test_wildcard_rule_unification() {
  let mut info = processor_info(
    "misc",
    "number_position",
    ProcessorKind::Annotator,
    vec![
      input_param("spans", "{annotation}"),
      output_param("out", "{annotation}:misc.number_position", None),
    ],
  );
  info.wildcards = vec![WildcardSpec {
    name: "annotation".into(),
    kind: WildcardKind::Annotation,
  }];
  let (rules, _) = compile_rules(
    "",
    vec![module_with("segment", vec![tokenizer(None)]), module_with("misc", vec![info])],
    &["doc"],
  )
  .unwrap();

  let producers = rules.find_producers("weft-workdir/doc/segment.sentence/misc.number_position");
  assert_eq!(producers.len(), 1);
  assert_eq!(producers[0].0.id, "misc:number_position");
  assert_eq!(producers[0].1.get("annotation").map(String::as_str), Some("segment.sentence"));
  assert_eq!(producers[0].1.get("file").map(String::as_str), Some("doc"));
}

#[test]
fn test_output_wildcard_without_input_is_invalid() {
  let mut info = processor_info(
    "misc",
    "bad",
    ProcessorKind::Annotator,
    vec![output_param("out", "{annotation}:misc.oops", None)],
  );
  info.wildcards = vec![WildcardSpec {
    name: "annotation".into(),
    kind: WildcardKind::Annotation,
  }];
  let err = compile_rules("", vec![module_with("misc", vec![info])], &["doc"]).unwrap_err();
  assert!(matches!(err, Error::ProcessorInvalid { .. }));
}

#[test]
fn test_selected_importer_gets_outputs() {
  let mut importer = processor_info("xml_import", "parse", ProcessorKind::Importer, vec![]);
  importer.file_extension = Some("xml".into());
  importer.import_outputs = vec![Reference::new("xml.text")];
  let mut other = processor_info("txt_import", "parse", ProcessorKind::Importer, vec![]);
  other.file_extension = Some("txt".into());

  let (rules, _) = compile_rules(
    "import:\n  importer: xml_import:parse\n",
    vec![module_with("xml_import", vec![importer]), module_with("txt_import", vec![other])],
    &["doc"],
  )
  .unwrap();

  let rule = rules.get("xml_import:parse").unwrap();
  assert!(rule.inputs.contains(&PathPattern::new("source/{file}.xml")));
  assert!(rule.outputs.contains(&PathPattern::new("weft-workdir/{file}/@text")));
  assert!(rule.outputs.contains(&PathPattern::new("weft-workdir/{file}/@structure")));
  assert!(rule.outputs.contains(&PathPattern::new("weft-workdir/{file}/xml.text/_span")));

  // the unselected importer is suppressed
  assert!(rules.get("txt_import:parse").is_none());
}

#[test]
fn test_custom_annotation_with_suffix() {
  let mut annotator = processor_info(
    "misc",
    "affix",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:misc.affixed", None),
      ParamSpec::new(
        "affix",
        ParamRole::Config {
          key: "misc.affix".into(),
          default: Some(serde_yaml::Value::String("+".into())),
        },
      ),
    ],
  );
  annotator.config = vec![
    crate::model::ConfigKeySpec::new("misc.affix", "Affix string").with_default(serde_yaml::Value::String("+".into())),
  ];

  let yaml = concat!(
    "custom_annotations:\n",
    "  - annotator: misc:affix\n",
    "    suffix: .double\n",
    "    config:\n",
    "      misc:\n",
    "        affix: '++'\n",
  );
  let (rules, _) = compile_rules(
    yaml,
    vec![module_with("segment", vec![tokenizer(None)]), module_with("misc", vec![annotator])],
    &["doc"],
  )
  .unwrap();

  let base = rules.get("misc:affix").unwrap();
  let custom = rules.get("misc:affix.double").unwrap();
  assert_eq!(base.params.get("affix"), Some(&ParamValue::Str("+".into())));
  assert_eq!(custom.params.get("affix"), Some(&ParamValue::Str("++".into())));
  // the suffix keeps outputs distinct
  assert!(custom.outputs.contains(&PathPattern::new("weft-workdir/{file}/segment.token/misc.affixed.double")));
  assert!(base.outputs.contains(&PathPattern::new("weft-workdir/{file}/segment.token/misc.affixed")));
}

#[test]
fn test_language_filter_marks_inactive() {
  let mut foreign = tokenizer(None);
  foreign.language = vec!["fin".into()];
  let (rules, _) = compile_rules("metadata:\n  language: swe\n", vec![module_with("segment", vec![foreign])], &["doc"]).unwrap();

  let rule = rules.get("segment:tokenize").unwrap();
  assert!(!rule.active);
  assert!(rules.find_producers("weft-workdir/doc/segment.token/_span").is_empty());
  assert_eq!(rules.find_inactive_producers("weft-workdir/doc/segment.token/_span").len(), 1);
}

#[test]
fn test_max_threads_from_config() {
  let (rules, _) = compile_rules(
    "threads:\n  segment:tokenize: 2\n",
    vec![module_with("segment", vec![tokenizer(None)])],
    &["doc"],
  )
  .unwrap();
  assert_eq!(rules.get("segment:tokenize").unwrap().max_threads, Some(2));
}

#[test]
fn test_export_annotations_become_inputs() {
  let exporter = processor_info(
    "xml_export",
    "pretty",
    ProcessorKind::Exporter,
    vec![
      ParamSpec::new(
        "annotations",
        ParamRole::ExportAnnotations {
          config_key: "export.annotations".into(),
          all_files: false,
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Export {
          path: "xml_export.pretty/{file}_export.xml".into(),
        },
      ),
    ],
  );
  let yaml = concat!(
    "export:\n",
    "  annotations:\n",
    "    - segment.token:saldo.baseform as lemma\n",
  );
  let (rules, _) = compile_rules(
    yaml,
    vec![module_with("segment", vec![tokenizer(None)]), module_with("xml_export", vec![exporter])],
    &["doc"],
  )
  .unwrap();

  let rule = rules.get("xml_export:pretty").unwrap();
  assert!(rule.inputs.contains(&PathPattern::new("weft-workdir/{file}/segment.token/saldo.baseform")));
  // the plain span parent is pulled in too
  assert!(rule.inputs.contains(&PathPattern::new("weft-workdir/{file}/segment.token/_span")));
  assert!(rule.outputs.contains(&PathPattern::new("export/xml_export.pretty/{file}_export.xml")));

  let items = match rule.params.get("annotations") {
    Some(ParamValue::ExportItems(items)) => items,
    other => panic!("unexpected binding: {other:?}"),
  };
  assert_eq!(items[0].export_name.as_deref(), Some("lemma"));

  let targets = rules.default_export_targets(
    &ConfigStore::from_yaml("").unwrap(),
    &["doc".to_string(), "doc2".to_string()],
  );
  assert!(targets.contains(&"export/xml_export.pretty/doc_export.xml".to_string()));
  assert!(targets.contains(&"export/xml_export.pretty/doc2_export.xml".to_string()));
}

#[test]
fn test_install_targets() {
  let installer = processor_info(
    "korp",
    "install",
    ProcessorKind::Installer,
    vec![ParamSpec::new(
      "marker",
      ParamRole::Marker {
        reference: Reference::new("korp.install_marker"),
      },
    )],
  );
  let (rules, _) = compile_rules(
    "install:\n  - korp:install\n",
    vec![module_with("korp", vec![installer])],
    &[],
  )
  .unwrap();
  let config = ConfigStore::from_yaml("install:\n  - korp:install\n").unwrap();
  let targets = rules.install_targets(&config, false).unwrap();
  assert_eq!(targets, vec!["weft-workdir/korp.install_marker".to_string()]);

  let missing = ConfigStore::from_yaml("install:\n  - korp:missing\n").unwrap();
  assert!(rules.install_targets(&missing, false).is_err());
}

#[test]
fn test_scalar_and_metadata_bindings() {
  let annotator = processor_info(
    "misc",
    "ids",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:misc.id", None),
      ParamSpec::new("corpus", ParamRole::Corpus),
      ParamSpec::new("lang", ParamRole::Language),
      ParamSpec::new(
        "prefix",
        ParamRole::Scalar {
          value: serde_yaml::Value::String("w".into()),
        },
      ),
    ],
  );
  let yaml = "metadata:\n  id: testcorpus\n  language: swe\n";
  let (rules, _) = compile_rules(
    yaml,
    vec![module_with("segment", vec![tokenizer(None)]), module_with("misc", vec![annotator])],
    &["doc"],
  )
  .unwrap();
  let rule = rules.get("misc:ids").unwrap();
  assert_eq!(rule.params.get("corpus"), Some(&ParamValue::Str("testcorpus".into())));
  assert_eq!(rule.params.get("lang"), Some(&ParamValue::Str("swe".into())));
  assert_eq!(rule.params.get("prefix"), Some(&ParamValue::Str("w".into())));
}

#[test]
fn test_config_sensitivity_snapshot() {
  let mut annotator = processor_info(
    "tagger",
    "tag",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:tagger.pos", None),
      ParamSpec::new(
        "model",
        ParamRole::Config {
          key: "tagger.model".into(),
          default: None,
        },
      ),
    ],
  );
  annotator.config = vec![crate::model::ConfigKeySpec::new("tagger.model", "Tagger model name")];
  let (rules, _) = compile_rules(
    "tagger:\n  model: suc3\n",
    vec![module_with("segment", vec![tokenizer(None)]), module_with("tagger", vec![annotator])],
    &["doc"],
  )
  .unwrap();
  let rule = rules.get("tagger:tag").unwrap();
  assert!(rule.configs.contains("tagger.model"));
  assert_eq!(rule.config_values.get("tagger.model").map(String::as_str), Some("suc3"));
}

#[test]
fn test_file_params_recorded() {
  let annotator = processor_info(
    "misc",
    "trace",
    ProcessorKind::Annotator,
    vec![
      input_param("token", "<token>"),
      output_param("out", "<token>:misc.trace", None),
      ParamSpec::new("source_file", ParamRole::SourceFilename),
    ],
  );
  let (rules, _) = compile_rules(
    "",
    vec![module_with("segment", vec![tokenizer(None)]), module_with("misc", vec![annotator])],
    &["doc"],
  )
  .unwrap();
  let rule = rules.get("misc:trace").unwrap();
  assert_eq!(rule.file_params, vec!["source_file".to_string()]);
  assert!(!rule.params.contains_key("source_file"));
}

#[test]
fn test_all_source_filenames_binding() {
  let exporter = processor_info(
    "stats",
    "freq",
    ProcessorKind::Exporter,
    vec![
      ParamSpec::new("files", ParamRole::AllSourceFilenames),
      ParamSpec::new(
        "annotations",
        ParamRole::ExportAnnotations {
          config_key: "export.annotations".into(),
          all_files: true,
        },
      ),
      ParamSpec::new(
        "out",
        ParamRole::Export {
          path: "stats.freq/frequencies.tsv".into(),
        },
      ),
    ],
  );
  let yaml = "export:\n  annotations:\n    - segment.token\n";
  let (rules, _) = compile_rules(
    yaml,
    vec![module_with("segment", vec![tokenizer(None)]), module_with("stats", vec![exporter])],
    &["a", "b"],
  )
  .unwrap();
  let rule = rules.get("stats:freq").unwrap();
  assert_eq!(
    rule.params.get("files"),
    Some(&ParamValue::Files(vec!["a".to_string(), "b".to_string()]))
  );
  // all_files expansion makes the inputs concrete
  assert!(rule.inputs.contains(&PathPattern::new("weft-workdir/a/segment.token/_span")));
  assert!(rule.inputs.contains(&PathPattern::new("weft-workdir/b/segment.token/_span")));
  assert!(!rule.per_file || rule.outputs.iter().all(|o| !o.has_placeholder("file")));
}
