use std::hash::{Hash, Hasher};

/// A resolved operator input: either a reference to another key or a literal
/// baked into the call site by the logical-graph resolver.
#[derive(Debug, Clone)]
pub enum SourceValue {
    Key(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SourceValue {
    pub fn key(key: impl Into<String>) -> Self {
        SourceValue::Key(key.into())
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            SourceValue::Key(key) => Some(key.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for SourceValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SourceValue::Key(a), SourceValue::Key(b)) => a == b,
            (SourceValue::Int(a), SourceValue::Int(b)) => a == b,
            // Bit equality so that dedup signatures are well defined for NaN.
            (SourceValue::Float(a), SourceValue::Float(b)) => a.to_bits() == b.to_bits(),
            (SourceValue::Bool(a), SourceValue::Bool(b)) => a == b,
            (SourceValue::Null, SourceValue::Null) => true,
            _ => false,
        }
    }
}

impl Eq for SourceValue {}

impl Hash for SourceValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            SourceValue::Key(key) => {
                state.write_u8(0);
                key.hash(state);
            }
            SourceValue::Int(value) => {
                state.write_u8(1);
                value.hash(state);
            }
            SourceValue::Float(value) => {
                state.write_u8(2);
                value.to_bits().hash(state);
            }
            SourceValue::Bool(value) => {
                state.write_u8(3);
                value.hash(state);
            }
            SourceValue::Null => state.write_u8(4),
        }
    }
}

/// A named computation step: one primitive call producing exactly one output
/// key from an ordered list of resolved sources. Immutable once placed in the
/// flat graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    /// Identifies which primitive (and, with the gradient suffix, which
    /// backward primitive) this operator calls.
    pub formula_key: String,
    pub output_key: String,
    pub sources: Vec<SourceValue>,
}

impl Operator {
    pub fn new(
        formula_key: impl Into<String>,
        output_key: impl Into<String>,
        sources: Vec<SourceValue>,
    ) -> Self {
        Self {
            formula_key: formula_key.into(),
            output_key: output_key.into(),
            sources,
        }
    }

    /// Keys consumed by this operator, in argument order.
    pub fn source_keys(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().filter_map(SourceValue::as_key)
    }
}
