use thiserror::Error;

/// Convenience alias used by every fallible code generation API.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// Errors surfaced while flattening a graph or generating source from it.
///
/// All variants are fatal: the pipeline never retries, and a cyclic graph or
/// a shape lookup miss indicates an upstream contract violation rather than a
/// recoverable condition.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// Topological ordering failed. The logical-graph resolver guarantees
    /// acyclicity upstream, so this surfaces a resolver bug.
    #[error("graph contains a cycle: {remaining} operator(s) could not be ordered")]
    CyclicGraph { remaining: usize },

    /// A key had no entry in the resolved shape table. Shapes are attached
    /// by the inference engine before the core runs, so a miss here is an
    /// internal consistency failure, not a user error.
    #[error("shape for key '{key}' not found in the resolved shape table")]
    ShapeLookup { key: String },

    /// The formula key does not resolve to a primitive in the registry the
    /// selected backend was built with.
    #[error("primitive '{formula_key}' is not registered for this backend")]
    UnsupportedPrimitive { formula_key: String },

    /// The requested operation cannot succeed for this graph/configuration
    /// combination. Raised before any native compilation is attempted.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CodegenError {
    pub fn config(message: impl Into<String>) -> Self {
        CodegenError::Config(message.into())
    }
}
