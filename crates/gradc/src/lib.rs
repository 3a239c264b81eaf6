//! Physical graph construction and native code generation for differentiable
//! computation graphs.
//!
//! The crate takes a resolved logical graph (operators whose input and output
//! ports have already been concretized into globally unique string keys, with
//! shapes attached) and turns it into a C translation unit exposing an
//! `evaluate` entrypoint and, unless the graph is inference-only, an
//! `evaluate_gradients` entrypoint implementing reverse-mode differentiation.
//!
//! The pipeline is: [`graph::FlatGraphBuilder`] flattens and deduplicates the
//! operator list into a topologically ordered [`graph::FlatGraph`],
//! [`codegen::StructKeys`] partitions every key into the role sets that decide
//! generated struct layout, and [`codegen::CodeGenerator`] renders the final
//! source text through the small C AST in [`codegen::c_ast`]. Compiling and
//! loading the emitted source is the job of the `gradc-backend-c` crate.

pub mod codegen;
pub mod config;
pub mod error;
pub mod graph;
pub mod primitives;
pub mod shape;

pub use codegen::{CodeGenerator, GeneratedSource, StructKeys};
pub use config::CodegenConfig;
pub use error::{CodegenError, CodegenResult};
pub use graph::{FlatGraph, FlatGraphBuilder, GraphBindings, Operator, SourceValue};
pub use primitives::{PrimitiveRegistry, PrimitiveSpec};
pub use shape::{Shape, ShapeTable};

/// Sentinel key identifying the scalar loss output that seeds reverse-mode
/// differentiation when the caller supplies no explicit cotangent.
pub const FINAL_COST_KEY: &str = "final_cost";

/// Suffix appended to a key to name its cotangent, and to a formula key to
/// name its backward primitive. Part of the serialized graph compatibility
/// surface, do not change without bumping the marshaling ABI.
pub const GRAD_SUFFIX: &str = "_grad";
