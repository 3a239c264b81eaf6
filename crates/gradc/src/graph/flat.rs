use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CodegenError, CodegenResult};
use crate::graph::{GraphBindings, Operator, SourceValue};

type Signature = (String, Vec<SourceValue>);

/// Incrementally flattens a resolved logical graph.
///
/// Two operators with the same formula key and identical resolved sources
/// collapse to one: the redundant operator is dropped and every later
/// reference to its output key is rewritten to the canonical output key.
/// Declaration order is preserved so that the final topological sort can
/// break ties deterministically.
#[derive(Debug, Default)]
pub struct FlatGraphBuilder {
    ops: Vec<Operator>,
    by_output: HashMap<String, usize>,
    canonical: HashMap<Signature, String>,
    aliases: HashMap<String, String>,
    output_dict: BTreeMap<String, String>,
}

impl FlatGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places an operator, returning the canonical key its output resolves
    /// to. When the operator duplicates an earlier one the existing key is
    /// returned and nothing is added.
    pub fn add_operator(&mut self, mut op: Operator) -> String {
        for source in op.sources.iter_mut() {
            if let SourceValue::Key(key) = source {
                if let Some(canonical) = self.aliases.get(key.as_str()) {
                    *key = canonical.clone();
                }
            }
        }

        let signature: Signature = (op.formula_key.clone(), op.sources.clone());
        if let Some(canonical) = self.canonical.get(&signature) {
            let canonical = canonical.clone();
            if op.output_key != canonical {
                self.aliases.insert(op.output_key.clone(), canonical.clone());
            }
            return canonical;
        }

        let output_key = op.output_key.clone();
        self.canonical.insert(signature, output_key.clone());
        self.by_output.insert(output_key.clone(), self.ops.len());
        self.ops.push(op);
        output_key
    }

    /// Records an externally visible alias for a produced key. The
    /// final-cost sentinel is attached to its producing key this way.
    pub fn alias_output(&mut self, alias: impl Into<String>, key: impl Into<String>) {
        let key: String = key.into();
        let key = self.resolve_key(&key);
        self.output_dict.insert(alias.into(), key);
    }

    /// Canonical key after duplicate elimination.
    pub fn resolve_key(&self, key: &str) -> String {
        match self.aliases.get(key) {
            Some(canonical) => canonical.clone(),
            None => key.to_string(),
        }
    }

    /// Orders the flattened operators topologically and derives the key
    /// sets. Ties are broken by first-declaration order, never by key name,
    /// so identical input graphs always produce identical orderings.
    pub fn finish(self, bindings: &GraphBindings) -> CodegenResult<FlatGraph> {
        let mut in_degree: Vec<usize> = vec![0; self.ops.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.ops.len()];
        for (idx, op) in self.ops.iter().enumerate() {
            for key in op.source_keys() {
                // Keys without a producer are externally supplied and add no
                // ordering constraint.
                if let Some(&producer) = self.by_output.get(key) {
                    in_degree[idx] += 1;
                    dependents[producer].push(idx);
                }
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| idx)
            .collect();
        let mut topological_order = Vec::with_capacity(self.ops.len());
        while let Some(&idx) = ready.iter().next() {
            ready.remove(&idx);
            topological_order.push(self.ops[idx].output_key.clone());
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
        if topological_order.len() != self.ops.len() {
            return Err(CodegenError::CyclicGraph {
                remaining: self.ops.len() - topological_order.len(),
            });
        }

        let mut all_keys: BTreeSet<String> = BTreeSet::new();
        let mut source_keys: BTreeSet<String> = BTreeSet::new();
        let mut consumer_counts: HashMap<String, usize> = HashMap::new();
        for op in &self.ops {
            all_keys.insert(op.output_key.clone());
            for key in op.source_keys() {
                all_keys.insert(key.to_string());
                source_keys.insert(key.to_string());
                *consumer_counts.entry(key.to_string()).or_insert(0) += 1;
            }
        }

        let aliased_outputs: BTreeSet<&String> = self.output_dict.values().collect();
        let unused_keys: BTreeSet<String> = self
            .ops
            .iter()
            .map(|op| op.output_key.clone())
            .filter(|key| {
                !source_keys.contains(key)
                    && !bindings.is_output(key)
                    && !aliased_outputs.contains(key)
            })
            .collect();

        Ok(FlatGraph {
            ops: self.ops,
            by_output: self.by_output,
            topological_order,
            output_dict: self.output_dict,
            all_keys,
            source_keys,
            unused_keys,
            consumer_counts,
        })
    }
}

/// The flattened, deduplicated, topologically ordered operation list.
///
/// Immutable once built; everything downstream (struct key classification,
/// code generation, the native bridge's marshaling layout) derives from it.
#[derive(Debug, Clone)]
pub struct FlatGraph {
    ops: Vec<Operator>,
    by_output: HashMap<String, usize>,
    topological_order: Vec<String>,
    output_dict: BTreeMap<String, String>,
    all_keys: BTreeSet<String>,
    source_keys: BTreeSet<String>,
    unused_keys: BTreeSet<String>,
    consumer_counts: HashMap<String, usize>,
}

impl FlatGraph {
    /// Produced keys in evaluation order. Each key is produced by exactly
    /// one operator.
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    pub fn get_op(&self, output_key: &str) -> Option<&Operator> {
        self.by_output.get(output_key).map(|&idx| &self.ops[idx])
    }

    pub fn source_values(&self, output_key: &str) -> &[SourceValue] {
        self.get_op(output_key)
            .map(|op| op.sources.as_slice())
            .unwrap_or(&[])
    }

    /// Every key mentioned anywhere in the graph, produced or consumed.
    pub fn all_keys(&self) -> &BTreeSet<String> {
        &self.all_keys
    }

    /// Keys consumed as an input by at least one operator.
    pub fn source_keys(&self) -> &BTreeSet<String> {
        &self.source_keys
    }

    /// Keys that are computed but never consumed and never surfaced as an
    /// output.
    pub fn unused_keys(&self) -> &BTreeSet<String> {
        &self.unused_keys
    }

    /// Externally visible aliases (notably the final-cost sentinel) mapped
    /// to the keys that produce them.
    pub fn output_dict(&self) -> &BTreeMap<String, String> {
        &self.output_dict
    }

    /// Number of source slots consuming `key`, counting each occurrence: an
    /// operator taking the same key twice contributes two. Gradient
    /// contributions must be accumulated rather than overwritten exactly
    /// when this exceeds one.
    pub fn consumer_count(&self, key: &str) -> usize {
        self.consumer_counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
