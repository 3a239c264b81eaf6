use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CodegenError, CodegenResult};
use crate::{FINAL_COST_KEY, GRAD_SUFFIX};

/// Resolved shape of a tensor key.
///
/// The core performs no shape algebra; shapes only decide allocation sizes
/// and which keys are marshaled across the foreign-call boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Every dimension statically known.
    Static(Vec<usize>),
    /// Statically unknown; keys with unknown shapes are skipped by the
    /// host-side allocator and marshaled as null.
    Unknown,
}

impl Shape {
    pub fn scalar() -> Self {
        Shape::Static(vec![1])
    }

    pub fn dims(&self) -> Option<&[usize]> {
        match self {
            Shape::Static(dims) => Some(dims),
            Shape::Unknown => None,
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.dims().map(|dims| dims.iter().product())
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Shape::Static(_))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::Static(dims)
    }
}

/// Key-indexed table of resolved shapes.
///
/// Lookup semantics are shared by the code generator and the native bridge:
/// the final-cost key is always `(1,)` regardless of its graph position, and
/// a cotangent key falls back to the shape of its base key with the gradient
/// suffix stripped. A miss is a [`CodegenError::ShapeLookup`], never a
/// silent default.
#[derive(Debug, Clone, Default)]
pub struct ShapeTable {
    shapes: BTreeMap<String, Shape>,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, shape: impl Into<Shape>) {
        self.shapes.insert(key.into(), shape.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_ok()
    }

    /// Resolves the shape for `key`, applying the final-cost and gradient
    /// suffix fallbacks.
    pub fn lookup(&self, key: &str) -> CodegenResult<Shape> {
        if key.starts_with(FINAL_COST_KEY) {
            return Ok(Shape::scalar());
        }
        if let Some(shape) = self.shapes.get(key) {
            return Ok(shape.clone());
        }
        if let Some(base) = key.strip_suffix(GRAD_SUFFIX) {
            if let Some(shape) = self.shapes.get(base) {
                return Ok(shape.clone());
            }
        }
        Err(CodegenError::ShapeLookup {
            key: key.to_string(),
        })
    }

    /// Resolves the shape and requires it to be statically known.
    pub fn known_dims(&self, key: &str) -> CodegenResult<Option<Vec<usize>>> {
        Ok(self.lookup(key)?.dims().map(|dims| dims.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_cost_is_scalar_regardless_of_table() {
        let mut table = ShapeTable::new();
        table.insert(FINAL_COST_KEY, vec![4, 4]);
        assert_eq!(table.lookup(FINAL_COST_KEY).unwrap(), Shape::scalar());
    }

    #[test]
    fn gradient_key_falls_back_to_base_shape() {
        let mut table = ShapeTable::new();
        table.insert("weight", vec![2, 3]);
        let shape = table.lookup("weight_grad").unwrap();
        assert_eq!(shape, Shape::Static(vec![2, 3]));
    }

    #[test]
    fn missing_key_is_a_lookup_error() {
        let table = ShapeTable::new();
        let err = table.lookup("missing").unwrap_err();
        assert!(matches!(err, CodegenError::ShapeLookup { .. }));
    }
}
