use std::collections::HashMap;
use std::sync::Arc;

use crate::codegen::c_ast::{Expr, Stmt};
use crate::codegen::Context;
use crate::graph::{Operator, SourceValue};

/// Rewrites an operator and its resolved inputs before the call expression
/// is built, optionally injecting statements ahead of the call. Used for
/// primitives that need extra arguments (an explicit output shape, a
/// workspace allocation) not present in the logical graph.
pub type PreProcessor = Arc<
    dyn Fn(Operator, Vec<SourceValue>, Context) -> (Operator, Vec<SourceValue>, Vec<Stmt>)
        + Send
        + Sync,
>;

/// Wraps the built call expression and optionally injects statements after
/// it. The accumulate-on-reuse rewrite in the gradient pass is the canonical
/// example.
pub type PostProcessor = Arc<dyn Fn(&Operator, Expr, Context) -> (Expr, Vec<Stmt>) + Send + Sync>;

/// Per-backend capability map of code-shape deviations, keyed by formula
/// key. Assembled once at backend construction; the generator consults it
/// but never mutates it. Default hooks registered here run before any
/// call-site-specific override.
#[derive(Clone, Default)]
pub struct CodegenHooks {
    pre: HashMap<String, PreProcessor>,
    post: HashMap<String, PostProcessor>,
}

impl CodegenHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre(mut self, formula_key: impl Into<String>, hook: PreProcessor) -> Self {
        self.pre.insert(formula_key.into(), hook);
        self
    }

    pub fn with_post(mut self, formula_key: impl Into<String>, hook: PostProcessor) -> Self {
        self.post.insert(formula_key.into(), hook);
        self
    }

    pub fn pre(&self, formula_key: &str) -> Option<&PreProcessor> {
        self.pre.get(formula_key)
    }

    pub fn post(&self, formula_key: &str) -> Option<&PostProcessor> {
        self.post.get(formula_key)
    }
}

impl std::fmt::Debug for CodegenHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodegenHooks")
            .field("pre", &self.pre.keys().collect::<Vec<_>>())
            .field("post", &self.post.keys().collect::<Vec<_>>())
            .finish()
    }
}
