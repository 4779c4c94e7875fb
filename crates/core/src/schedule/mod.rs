//! DAG construction and scheduling.
//!
//! The scheduler walks requested target files backwards through the rule
//! set: every target is unified against rule outputs, the preferred
//! producer is instantiated into a job node, and its inputs are resolved
//! recursively. Backoff producers are tried when the preferred rule proves
//! unsatisfiable (an input nothing can produce). The resulting file-level
//! DAG is executed by the runner with a bounded worker pool, skipping nodes
//! whose content keys are unchanged.

pub mod keys;
pub mod runner;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

pub use runner::{RemoteDispatcher, RemoteOutcome, RunReport, RunnerOptions};

use crate::compile::{Rule, RuleSet, WildcardBindings};
use crate::dirs::Paths;
use crate::exec::{Bindings, ParamValue};
use crate::{Error, Result};

/// One schedulable job: a rule instantiated with concrete bindings.
#[derive(Clone, Debug)]
pub struct JobNode {
  /// Stable job identifier (also the content-key store key).
  pub id: String,
  pub rule: Arc<Rule>,
  pub bindings: WildcardBindings,
  /// Corpus-relative (or absolute, for models) concrete input paths.
  pub inputs: Vec<String>,
  pub outputs: Vec<String>,
  /// Parameter bindings with wildcards and the source file bound.
  pub params: Bindings,
}

impl JobNode {
  pub fn file(&self) -> Option<&str> {
    self.bindings.get("file").map(String::as_str)
  }

  /// Resolve a job-relative path against the corpus directory.
  pub fn absolute(paths: &Paths, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
      p.to_path_buf()
    } else {
      paths.corpus_dir.join(p)
    }
  }
}

/// The job DAG for one run.
#[derive(Debug)]
pub struct JobGraph {
  pub nodes: Vec<JobNode>,
  /// producer -> consumer edges.
  pub edges: Vec<(usize, usize)>,
}

impl JobGraph {
  /// Build the DAG for the requested targets.
  pub fn build(rules: &RuleSet, paths: &Paths, targets: &[String], language: &str) -> Result<Self> {
    let mut builder = GraphBuilder {
      rules,
      paths,
      language: language.to_string(),
      nodes: Vec::new(),
      producer_of: HashMap::new(),
      job_index: HashMap::new(),
      edges: HashSet::new(),
      stack: Vec::new(),
    };

    for target in targets {
      builder.resolve_target(target)?;
    }

    let graph = JobGraph {
      nodes: builder.nodes,
      edges: builder.edges.into_iter().collect(),
    };
    graph.check_acyclic()?;
    debug!(jobs = graph.nodes.len(), edges = graph.edges.len(), "job graph built");
    Ok(graph)
  }

  /// The registry builds a DAG by construction, but remembered decisions
  /// and wildcard instantiation can still conspire to form cycles.
  fn check_acyclic(&self) -> Result<()> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let indices: Vec<_> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
    for (from, to) in &self.edges {
      graph.add_edge(indices[*from], indices[*to], ());
    }
    toposort(&graph, None).map_err(|cycle| {
      let job = &self.nodes[graph[cycle.node_id()]].id;
      Error::User(format!("dependency cycle involving job '{job}'"))
    })?;
    Ok(())
  }

  /// Dependency edges as adjacency lists (consumer -> producers count,
  /// producer -> consumers).
  pub fn adjacency(&self) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut indegree = vec![0usize; self.nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
    for (producer, consumer) in &self.edges {
      indegree[*consumer] += 1;
      dependents[*producer].push(*consumer);
    }
    (indegree, dependents)
  }
}

struct GraphBuilder<'a> {
  rules: &'a RuleSet,
  paths: &'a Paths,
  language: String,
  nodes: Vec<JobNode>,
  /// Concrete output path -> producing node.
  producer_of: HashMap<String, usize>,
  /// Job id -> node index (a job may produce several requested outputs).
  job_index: HashMap<String, usize>,
  edges: HashSet<(usize, usize)>,
  stack: Vec<String>,
}

impl GraphBuilder<'_> {
  /// Resolve one target path: find (or create) its producing job, or accept
  /// it as an existing leaf file. Returns the producing node, if any.
  fn resolve_target(&mut self, target: &str) -> Result<Option<usize>> {
    if let Some(&node) = self.producer_of.get(target) {
      return Ok(Some(node));
    }

    let candidates = self.rules.find_producers(target);
    if candidates.is_empty() {
      if JobNode::absolute(self.paths, target).exists() {
        // A pre-existing file with no producer (source files, models built
        // elsewhere) is a valid leaf
        return Ok(None);
      }
      if !self.rules.find_inactive_producers(target).is_empty() {
        return Err(Error::LanguageUnsupported {
          language: self.language.clone(),
          output: target.to_string(),
        });
      }
      return Err(Error::NoProducer(target.to_string()));
    }

    // Preferred producer first; a backoff producer fires only when the
    // preferred one is unsatisfiable
    let mut last_err: Option<Error> = None;
    for (rule, bindings) in candidates {
      match self.instantiate(&rule, &bindings, target) {
        Ok(node) => return Ok(Some(node)),
        Err(e @ (Error::NoProducer(_) | Error::LanguageUnsupported { .. })) => {
          trace!(rule = %rule.id, target, "producer unsatisfiable, trying backoff");
          last_err = Some(e);
        }
        Err(other) => return Err(other),
      }
    }
    Err(last_err.unwrap_or_else(|| Error::NoProducer(target.to_string())))
  }

  fn instantiate(&mut self, rule: &Arc<Rule>, bindings: &WildcardBindings, target: &str) -> Result<usize> {
    let job_id = job_identifier(&rule.id, bindings);

    if let Some(&existing) = self.job_index.get(&job_id) {
      self.producer_of.insert(target.to_string(), existing);
      return Ok(existing);
    }
    if self.stack.contains(&job_id) {
      return Err(Error::User(format!("dependency cycle involving job '{job_id}'")));
    }

    // All outputs must become concrete under the unified bindings
    let mut outputs = Vec::new();
    for pattern in &rule.outputs {
      let bound = pattern.bind(bindings);
      if !bound.is_concrete() {
        return Err(Error::NoProducer(format!(
          "output '{bound}' of rule '{}' has unbound wildcards for target '{target}'",
          rule.id
        )));
      }
      outputs.push(bound.as_str().to_string());
    }

    // Wildcards appearing only in inputs are forced to the unified values;
    // anything left unbound makes the rule unsatisfiable for this target
    let mut inputs = Vec::new();
    for pattern in &rule.inputs {
      let bound = pattern.bind(bindings);
      if !bound.is_concrete() {
        return Err(Error::NoProducer(format!(
          "input '{bound}' of rule '{}' has unbound wildcards",
          rule.id
        )));
      }
      inputs.push(bound.as_str().to_string());
    }

    self.stack.push(job_id.clone());
    let result = (|| -> Result<Vec<(String, Option<usize>)>> {
      let mut resolved = Vec::new();
      for input in &inputs {
        let producer = self.resolve_target(input)?;
        resolved.push((input.clone(), producer));
      }
      Ok(resolved)
    })();
    self.stack.pop();
    let resolved = result?;

    let node_index = self.nodes.len();
    let node = JobNode {
      id: job_id.clone(),
      rule: Arc::clone(rule),
      bindings: bindings.clone(),
      inputs,
      outputs: outputs.clone(),
      params: bind_job_params(rule, bindings),
    };
    self.nodes.push(node);
    self.job_index.insert(job_id, node_index);
    for output in outputs {
      self.producer_of.insert(output, node_index);
    }
    for (_, producer) in resolved {
      if let Some(producer) = producer {
        self.edges.insert((producer, node_index));
      }
    }
    Ok(node_index)
  }
}

/// Stable job identifier from a rule and its wildcard bindings.
pub fn job_identifier(rule_id: &str, bindings: &WildcardBindings) -> String {
  if bindings.is_empty() {
    return rule_id.to_string();
  }
  let suffix: Vec<String> = bindings.iter().map(|(k, v)| format!("{k}={v}")).collect();
  format!("{rule_id}@{}", suffix.join(","))
}

/// Bind wildcards and the source file into a rule's parameter bindings.
pub fn bind_job_params(rule: &Rule, bindings: &WildcardBindings) -> Bindings {
  let mut params: Bindings = rule
    .params
    .iter()
    .map(|(name, value)| {
      let bound = match value {
        ParamValue::Annotation(r) => ParamValue::Annotation(r.bind_wildcards(bindings)),
        ParamValue::Annotations(rs) => {
          ParamValue::Annotations(rs.iter().map(|r| r.bind_wildcards(bindings)).collect())
        }
        ParamValue::ExportItems(items) => ParamValue::ExportItems(
          items
            .iter()
            .map(|item| crate::exec::ExportItem {
              reference: item.reference.bind_wildcards(bindings),
              export_name: item.export_name.clone(),
            })
            .collect(),
        ),
        ParamValue::Str(s) => {
          ParamValue::Str(crate::compile::PathPattern::new(s.clone()).bind(bindings).as_str().to_string())
        }
        other => other.clone(),
      };
      (name.clone(), bound)
    })
    .collect();

  if let Some(file) = bindings.get("file") {
    for name in &rule.file_params {
      params.insert(name.clone(), ParamValue::Str(file.clone()));
    }
  }
  params
}

/// Fingerprint over the parameter bindings a preloader is keyed on. A
/// preloader started with different bindings refuses the job.
pub fn preload_fingerprint(rule: &Rule, params: &Bindings) -> Option<String> {
  let preloader = rule.preloader.as_ref()?;
  let mut hasher = Sha256::new();
  hasher.update(rule.processor.info.id().as_bytes());
  let mut names: Vec<&String> = preloader.params.iter().collect();
  names.sort();
  for name in names {
    hasher.update(name.as_bytes());
    let fingerprint = params.get(name).map(ParamValue::fingerprint).unwrap_or_default();
    hasher.update(fingerprint.as_bytes());
  }
  Some(format!("{:x}", hasher.finalize()))
}

/// References read as inputs must have a producer or exist already; verify
/// up front so `NoProducer` surfaces before any job starts.
pub fn verify_targets(rules: &RuleSet, paths: &Paths, targets: &[String], language: &str) -> Result<()> {
  JobGraph::build(rules, paths, targets, language).map(|_| ())
}
