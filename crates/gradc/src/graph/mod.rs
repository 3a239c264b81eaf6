//! Flattened physical graph: operators, source values, and the deduplicated,
//! topologically ordered operation list consumed by code generation.

mod flat;
mod op;

pub use flat::{FlatGraph, FlatGraphBuilder};
pub use op::{Operator, SourceValue};

use std::collections::BTreeSet;

use crate::{FINAL_COST_KEY, GRAD_SUFFIX};

/// Declared I/O of a resolved graph, handed to the core by the logical-graph
/// resolver together with the operator list.
#[derive(Debug, Clone, Default)]
pub struct GraphBindings {
    /// Keys supplied by the caller at evaluation time (parameters and data).
    pub input_keys: BTreeSet<String>,
    /// Externally visible output keys, in declaration order.
    pub output_keys: Vec<String>,
    /// Keys for which the caller may supply explicit output cotangents.
    pub cotangent_keys: BTreeSet<String>,
    /// Keys participating in differentiation. Which keys require gradients
    /// is decided by the upstream resolver, not by this core.
    pub differentiable_keys: BTreeSet<String>,
    /// Inference-only graphs get no gradient function or gradient structs.
    pub inference: bool,
}

impl GraphBindings {
    /// Whether `key` participates in a gradient path. Accepts both base keys
    /// and suffixed cotangent keys; the final-cost sentinel always does.
    pub fn has_grad(&self, key: &str) -> bool {
        let base = key.strip_suffix(GRAD_SUFFIX).unwrap_or(key);
        if base.starts_with(FINAL_COST_KEY) {
            return true;
        }
        self.differentiable_keys.contains(base)
    }

    pub fn is_output(&self, key: &str) -> bool {
        self.output_keys.iter().any(|k| k == key)
    }
}
