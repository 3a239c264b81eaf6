use std::collections::BTreeSet;

use crate::config::CodegenConfig;
use crate::graph::{FlatGraph, GraphBindings};
use crate::{FINAL_COST_KEY, GRAD_SUFFIX};

/// The five disjoint role sets deciding generated struct layout.
///
/// Every set is sorted lexicographically before reaching the emitter: field
/// order fixes the generated struct's memory layout, and the bridge's
/// marshaling layer recomputes the same order on the host side. Both sides
/// must agree byte for byte, so the sort here is the single source of truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructKeys {
    pub eval_input_keys: Vec<String>,
    pub eval_output_keys: Vec<String>,
    pub eval_cache_keys: Vec<String>,
    pub eval_grad_input_keys: Vec<String>,
    pub eval_grad_output_keys: Vec<String>,
}

impl StructKeys {
    /// Pure classification of every graph key into its layout role.
    pub fn determine(graph: &FlatGraph, bindings: &GraphBindings, config: &CodegenConfig) -> Self {
        let input_set: BTreeSet<&str> = bindings.input_keys.iter().map(String::as_str).collect();

        let eval_input_keys: Vec<String> = if config.use_output_as_input {
            // Output storage doubles as input storage: the input struct must
            // cover every key in the graph.
            graph.all_keys().iter().cloned().collect()
        } else {
            bindings.input_keys.iter().cloned().collect()
        };

        let mut eval_output_keys: Vec<String> = bindings.output_keys.clone();
        eval_output_keys.sort();

        let eval_cache_keys: Vec<String> = graph
            .all_keys()
            .iter()
            .filter(|key| !input_set.contains(key.as_str()))
            .cloned()
            .collect();
        let cache_set: BTreeSet<&str> = eval_cache_keys.iter().map(String::as_str).collect();

        let mut grad_inputs: BTreeSet<String> = bindings.input_keys.clone();
        grad_inputs.extend(bindings.output_keys.iter().cloned());
        grad_inputs.extend(
            bindings
                .cotangent_keys
                .iter()
                .map(|key| format!("{key}{GRAD_SUFFIX}")),
        );
        // An attached final cost seeds the reverse pass through its
        // sentinel cotangent even when no explicit cotangent is declared.
        if graph.output_dict().contains_key(FINAL_COST_KEY) {
            grad_inputs.insert(format!("{FINAL_COST_KEY}{GRAD_SUFFIX}"));
        }
        // Cache keys already live in the persistent cache struct; keeping
        // them out of the gradient input struct keeps the two foreign-call
        // structs disjoint.
        let eval_grad_input_keys: Vec<String> = grad_inputs
            .into_iter()
            .filter(|key| !cache_set.contains(key.as_str()))
            .collect();

        let eval_grad_output_keys: Vec<String> = bindings
            .input_keys
            .iter()
            .filter(|key| bindings.has_grad(key))
            .map(|key| format!("{key}{GRAD_SUFFIX}"))
            .collect();

        // BTreeSet iteration already yields sorted order for the derived
        // sets; the declared outputs were sorted explicitly above.
        Self {
            eval_input_keys,
            eval_output_keys,
            eval_cache_keys,
            eval_grad_input_keys,
            eval_grad_output_keys,
        }
    }

    pub fn is_cache_key(&self, key: &str) -> bool {
        self.eval_cache_keys.iter().any(|k| k == key)
    }

    pub fn is_eval_input(&self, key: &str) -> bool {
        self.eval_input_keys.iter().any(|k| k == key)
    }

    pub fn is_grad_input(&self, key: &str) -> bool {
        self.eval_grad_input_keys.iter().any(|k| k == key)
    }
}
