//! Primitive dispatch table.
//!
//! Formula keys in the serialized graph format are strings; the registry
//! resolves them once, at backend construction time, into typed
//! [`PrimitiveSpec`] entries so that neither the generators nor the bridge
//! format symbol names on the fly.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{CodegenError, CodegenResult};
use crate::GRAD_SUFFIX;

/// Resolved call targets for one formula key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveSpec {
    /// Symbol of the forward kernel in the backend's kernel library.
    pub forward_symbol: String,
    /// Symbol of the backward kernel, absent for non-differentiable
    /// primitives.
    pub backward_symbol: Option<String>,
}

impl PrimitiveSpec {
    /// Standard naming: the forward symbol is the formula key itself and
    /// the backward symbol carries the gradient suffix.
    pub fn standard(formula_key: &str) -> Self {
        Self {
            forward_symbol: formula_key.to_string(),
            backward_symbol: Some(format!("{formula_key}{GRAD_SUFFIX}")),
        }
    }

    /// A primitive with no backward counterpart.
    pub fn forward_only(formula_key: &str) -> Self {
        Self {
            forward_symbol: formula_key.to_string(),
            backward_symbol: None,
        }
    }
}

/// Maps formula keys to native call targets for one backend.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveRegistry {
    table: HashMap<String, PrimitiveSpec>,
}

/// Formula keys every C-style kernel library is expected to provide.
const STANDARD_PRIMITIVES: &[&str] = &[
    "add",
    "subtract",
    "multiplication",
    "divide",
    "matrix_multiplication",
    "transpose",
    "relu",
    "sigmoid",
    "softmax",
    "tanh",
    "exp",
    "abs",
    "reduce_sum",
    "reduce_mean",
    "squared_error",
    "cross_entropy",
    "broadcast_to",
];

static DEFAULT_REGISTRY: Lazy<PrimitiveRegistry> = Lazy::new(PrimitiveRegistry::with_standard_ops);

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the standard elementwise/linear-algebra
    /// formula keys.
    pub fn with_standard_ops() -> Self {
        let mut registry = Self::new();
        for key in STANDARD_PRIMITIVES {
            registry.register(*key, PrimitiveSpec::standard(key));
        }
        registry
    }

    /// Shared default registry, built once.
    pub fn standard() -> &'static PrimitiveRegistry {
        &DEFAULT_REGISTRY
    }

    pub fn register(&mut self, formula_key: impl Into<String>, spec: PrimitiveSpec) {
        self.table.insert(formula_key.into(), spec);
    }

    pub fn contains(&self, formula_key: &str) -> bool {
        self.table.contains_key(formula_key)
    }

    pub fn resolve(&self, formula_key: &str) -> CodegenResult<&PrimitiveSpec> {
        self.table
            .get(formula_key)
            .ok_or_else(|| CodegenError::UnsupportedPrimitive {
                formula_key: formula_key.to_string(),
            })
    }

    /// Backward symbol for a formula key; an error when the primitive is
    /// unknown or has no backward kernel.
    pub fn resolve_backward(&self, formula_key: &str) -> CodegenResult<&str> {
        self.resolve(formula_key)?
            .backward_symbol
            .as_deref()
            .ok_or_else(|| CodegenError::UnsupportedPrimitive {
                formula_key: format!("{formula_key}{GRAD_SUFFIX}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_resolves_forward_and_backward() {
        let registry = PrimitiveRegistry::standard();
        let spec = registry.resolve("add").unwrap();
        assert_eq!(spec.forward_symbol, "add");
        assert_eq!(registry.resolve_backward("add").unwrap(), "add_grad");
    }

    #[test]
    fn unknown_primitive_is_rejected() {
        let registry = PrimitiveRegistry::standard();
        let err = registry.resolve("winograd_conv3d").unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedPrimitive { .. }));
    }

    #[test]
    fn forward_only_primitive_has_no_backward() {
        let mut registry = PrimitiveRegistry::new();
        registry.register("argmax", PrimitiveSpec::forward_only("argmax"));
        assert!(registry.resolve_backward("argmax").is_err());
    }
}
