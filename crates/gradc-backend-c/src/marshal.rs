//! Host-side mirror of the generated struct layouts.
//!
//! Generated structs contain nothing but `Array *` fields, one per key, in
//! the lexicographically sorted order fixed by the struct key classifier. A
//! block of consecutive pointers has the identical memory layout, so the
//! bridge passes `Vec<*mut CArray>` where the generated code expects a
//! struct pointer. The classifier's sort is the single source of truth for
//! field order on both sides; any drift is caught by the contract tests
//! below rather than by a runtime crash.

use std::collections::BTreeMap;
use std::ptr;

use crate::array::CArray;

/// Bumped whenever the field layout rules or the entry shim convention
/// change. Compiled artifacts from another version must not be loaded.
pub const MARSHAL_ABI_VERSION: u32 = 1;

/// Field layout of one generated struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    name: String,
    fields: Vec<String>,
}

impl StructLayout {
    /// `fields` must already be in generated order (sorted); the classifier
    /// guarantees this.
    pub fn new(name: impl Into<String>, fields: &[String]) -> Self {
        debug_assert!(fields.windows(2).all(|w| w[0] <= w[1]));
        Self {
            name: name.into(),
            fields: fields.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_index(&self, key: &str) -> Option<usize> {
        self.fields.iter().position(|field| field == key)
    }

    /// Translates a key-indexed pointer map into the positional block the
    /// generated struct expects. Keys absent from the map marshal as null,
    /// matching the generated code's expectation for unavailable storage.
    pub fn marshal(&self, pointers: &BTreeMap<String, *mut CArray>) -> Vec<*mut CArray> {
        self.fields
            .iter()
            .map(|field| pointers.get(field).copied().unwrap_or(ptr::null_mut()))
            .collect()
    }

    /// Pairs each field with the pointer the foreign call left in the
    /// output block.
    pub fn unmarshal<'a>(
        &'a self,
        block: &'a [*mut CArray],
    ) -> impl Iterator<Item = (&'a str, *mut CArray)> + 'a {
        self.fields
            .iter()
            .map(String::as_str)
            .zip(block.iter().copied())
    }
}
