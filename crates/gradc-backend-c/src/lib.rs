//! Native bridge for `gradc`-generated C source.
//!
//! Takes printed source text, invokes the configured C compiler to produce a
//! shared library, loads it with `libloading`, and exposes host-callable
//! `evaluate` / `evaluate_gradients` wrappers that marshal between
//! [`HostArray`] values and the struct-based foreign calling convention laid
//! out by `gradc`'s struct key classifier.
//!
//! The whole pipeline is synchronous; the only blocking point is the
//! compiler subprocess. Each [`CompiledModel`] owns its generated source,
//! its library handle and the single persistent cache instance inside that
//! library, so concurrent in-flight evaluations of one model require
//! external synchronization. Independent models are fully isolated.

mod array;
mod compile;
mod error;
mod marshal;
mod model;

pub use array::{CArray, HostArray};
pub use compile::{compile_command, compile_shared, resolve_dynamic_link, shared_library_suffix};
pub use error::{BridgeError, BridgeResult};
pub use marshal::{StructLayout, MARSHAL_ABI_VERSION};
pub use model::{ArrayMap, CompiledModel};
