use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::ptr::{self, NonNull};

use gradc::codegen::{
    CodeGenerator, CodegenHooks, EVALUATE_GRADIENTS_SHIM_FN, EVALUATE_SHIM_FN, EVAL_INPUT_STRUCT,
    EVAL_OUTPUT_STRUCT, GRAD_INPUT_STRUCT, GRAD_OUTPUT_STRUCT,
};
use gradc::{
    CodegenConfig, FlatGraph, GraphBindings, PrimitiveRegistry, ShapeTable, StructKeys,
    FINAL_COST_KEY, GRAD_SUFFIX,
};
use libloading::Library;
use tracing::{debug, info};

use crate::array::{CArray, HostArray};
use crate::compile::{compile_shared, resolve_dynamic_link, shared_library_suffix};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal::StructLayout;

/// The ABI-stable entry convention: a block of input pointers and an
/// out-block the callee fills. See the entry shims emitted by the
/// generator.
type EntryShimFn = unsafe extern "C" fn(*const *mut CArray, *mut *mut CArray);

/// Key-indexed argument/result mapping used by the wrapper calls.
pub type ArrayMap = BTreeMap<String, HostArray>;

/// A generated, compiled and loaded model.
///
/// Owns the generated source, the loaded library (and any pre-loaded
/// dynamic links) and the host-side struct layouts. The cache struct inside
/// the library is a single persistent instance, so at most one evaluation
/// of a given model may be in flight at a time; callers needing parallelism
/// instantiate independent models.
pub struct CompiledModel {
    graph: FlatGraph,
    bindings: GraphBindings,
    shapes: ShapeTable,
    config: CodegenConfig,
    struct_keys: StructKeys,
    source: String,
    source_path: PathBuf,
    library_path: PathBuf,
    input_layout: StructLayout,
    output_layout: StructLayout,
    grad_input_layout: StructLayout,
    grad_output_layout: StructLayout,
    evaluate_fn: EntryShimFn,
    gradients_fn: Option<EntryShimFn>,
    // The main library must drop before its preloaded dependencies.
    _library: Library,
    _preloaded: Vec<Library>,
}

impl CompiledModel {
    /// Generates source for the graph, compiles it into a shared library,
    /// loads it and resolves the entry symbols.
    ///
    /// Configuration problems (a gradient request with no possible seed, an
    /// unregistered primitive) fail here before any file is written or any
    /// subprocess is spawned.
    pub fn compile(
        graph: FlatGraph,
        bindings: GraphBindings,
        shapes: ShapeTable,
        config: CodegenConfig,
        registry: &PrimitiveRegistry,
        hooks: &CodegenHooks,
        source_path: Option<PathBuf>,
    ) -> BridgeResult<Self> {
        let generator = CodeGenerator::new(&graph, &bindings, &config, registry, hooks);
        let generated = generator.generate_source()?;

        let source_path = match source_path {
            Some(path) => path,
            None => std::env::temp_dir().join(format!(
                "gradc_model_{:016x}.c",
                fingerprint(&generated.code)
            )),
        };
        let lib_ext = shared_library_suffix().trim_start_matches('.');
        let library_path = source_path.with_extension(lib_ext);

        std::fs::write(&source_path, &generated.code)?;
        compile_shared(&source_path, &library_path, &config)?;

        let mut preloaded = Vec::new();
        for link in &config.dynamic_links {
            let path = resolve_dynamic_link(&config.src_path, link)?;
            debug!(link = %path.display(), "pre-loading dynamic link");
            preloaded.push(unsafe { Library::new(&path) }?);
        }

        let library = unsafe { Library::new(&library_path) }?;
        let evaluate_fn = unsafe {
            library
                .get::<EntryShimFn>(EVALUATE_SHIM_FN.as_bytes())
                .map(|symbol| *symbol)
        }?;
        let gradients_fn = if bindings.inference {
            None
        } else {
            Some(unsafe {
                library
                    .get::<EntryShimFn>(EVALUATE_GRADIENTS_SHIM_FN.as_bytes())
                    .map(|symbol| *symbol)
            }?)
        };

        let struct_keys = generated.struct_keys;
        info!(
            library = %library_path.display(),
            ops = graph.len(),
            "compiled model loaded"
        );

        Ok(Self {
            input_layout: StructLayout::new(EVAL_INPUT_STRUCT, &struct_keys.eval_input_keys),
            output_layout: StructLayout::new(EVAL_OUTPUT_STRUCT, &struct_keys.eval_output_keys),
            grad_input_layout: StructLayout::new(
                GRAD_INPUT_STRUCT,
                &struct_keys.eval_grad_input_keys,
            ),
            grad_output_layout: StructLayout::new(
                GRAD_OUTPUT_STRUCT,
                &struct_keys.eval_grad_output_keys,
            ),
            graph,
            bindings,
            shapes,
            config,
            struct_keys,
            source: generated.code,
            source_path,
            library_path,
            evaluate_fn,
            gradients_fn,
            _library: library,
            _preloaded: preloaded,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_path(&self) -> &std::path::Path {
        &self.source_path
    }

    pub fn library_path(&self) -> &std::path::Path {
        &self.library_path
    }

    pub fn struct_keys(&self) -> &StructKeys {
        &self.struct_keys
    }

    /// Runs the forward pass.
    ///
    /// `params`, `data` and `cache` are merged into one key-indexed input
    /// mapping. With `allocate_internals` set, storage is allocated for any
    /// input-struct key with a known shape the caller did not supply. The
    /// result maps every externally visible output key (or every output
    /// field when `include_internals` is set) to its array.
    pub fn evaluate(
        &self,
        params: &ArrayMap,
        data: &ArrayMap,
        cache: &ArrayMap,
        include_internals: bool,
    ) -> BridgeResult<ArrayMap> {
        let mut pointers: BTreeMap<String, *mut CArray> = BTreeMap::new();
        for (key, value) in params.iter().chain(data.iter()).chain(cache.iter()) {
            pointers.insert(key.clone(), value.as_record_ptr());
        }

        // Scratch allocations must outlive the foreign call.
        let mut scratch: Vec<HostArray> = Vec::new();
        if self.config.allocate_internals {
            for key in self.input_layout.fields() {
                if pointers.contains_key(key) || key.as_str() == FINAL_COST_KEY {
                    continue;
                }
                if let Some(dims) = self.shapes.lookup(key)?.dims() {
                    let array = HostArray::empty(dims.to_vec());
                    pointers.insert(key.clone(), array.as_record_ptr());
                    scratch.push(array);
                }
            }
        }

        let block = self.marshal_block(&self.input_layout, &pointers, true)?;
        let mut out_block: Vec<*mut CArray> = vec![ptr::null_mut(); self.output_layout.len()];
        unsafe { (self.evaluate_fn)(block.as_ptr(), out_block.as_mut_ptr()) };
        drop(scratch);

        let return_keys: Vec<String> = if include_internals {
            self.output_layout.fields().to_vec()
        } else {
            self.bindings.output_keys.clone()
        };
        let final_mapped = self.graph.output_dict().get(FINAL_COST_KEY);

        let mut outputs = ArrayMap::new();
        for key in &return_keys {
            if key.as_str() == FINAL_COST_KEY && !self.config.return_output {
                continue;
            }
            let field_key = if key.as_str() == FINAL_COST_KEY {
                match final_mapped {
                    Some(mapped) => mapped.as_str(),
                    None => continue,
                }
            } else {
                key.as_str()
            };
            let Some(index) = self.output_layout.field_index(field_key) else {
                continue;
            };
            if final_mapped.map(String::as_str) == Some(field_key) {
                let record = NonNull::new(out_block[index]).ok_or_else(|| {
                    BridgeError::NullOutput { key: key.clone() }
                })?;
                // The final-cost value is a scalar regardless of its graph
                // position; surface it under both names.
                outputs.insert(FINAL_COST_KEY.to_string(), unsafe {
                    HostArray::from_foreign(record, vec![1])
                });
                outputs.insert(field_key.to_string(), unsafe {
                    HostArray::from_foreign(record, vec![1])
                });
            } else {
                let Some(dims) = self.shapes.known_dims(key)? else {
                    continue;
                };
                let record = NonNull::new(out_block[index]).ok_or_else(|| {
                    BridgeError::NullOutput { key: key.clone() }
                })?;
                outputs.insert(key.clone(), unsafe {
                    HostArray::from_foreign(record, dims)
                });
            }
        }
        Ok(outputs)
    }

    /// Runs a forward pass to populate the cache, then the reverse-mode
    /// gradient pass. Returns the forward outputs and the gradients keyed
    /// by the differentiated input keys.
    ///
    /// With no explicit `output_gradients`, the cotangent defaults to a
    /// unit scalar seeded through the final-cost output; a graph with
    /// neither fails immediately.
    pub fn evaluate_gradients(
        &self,
        params: &ArrayMap,
        data: &ArrayMap,
        output_gradients: Option<&ArrayMap>,
    ) -> BridgeResult<(ArrayMap, ArrayMap)> {
        let gradients_fn = self.gradients_fn.ok_or_else(|| {
            BridgeError::config("model was compiled for inference only")
        })?;
        if output_gradients.is_none() && !self.graph.output_dict().contains_key(FINAL_COST_KEY) {
            return Err(BridgeError::config(
                "output gradients are required when no final cost is attached",
            ));
        }

        let mut scratch: Vec<HostArray> = Vec::new();
        let mut grad_ptrs: BTreeMap<String, *mut CArray> = BTreeMap::new();
        match output_gradients {
            Some(map) => {
                for (key, value) in map {
                    grad_ptrs.insert(key.clone(), value.as_record_ptr());
                }
            }
            None => {
                let seed = HostArray::ones(vec![1]);
                grad_ptrs.insert(FINAL_COST_KEY.to_string(), seed.as_record_ptr());
                scratch.push(seed);
            }
        }
        if let Some(seed) = grad_ptrs.get(FINAL_COST_KEY).copied() {
            if let Some(mapped) = self.graph.output_dict().get(FINAL_COST_KEY) {
                grad_ptrs.insert(mapped.clone(), seed);
            }
        }

        let empty = ArrayMap::new();
        let forward = self.evaluate(params, data, &empty, self.config.allocate_internals)?;

        if self.config.allocate_internals {
            // Internal gradient storage starts out zeroed so that
            // accumulation is well defined on the first contribution.
            for key in self.graph.source_keys().difference(self.graph.unused_keys()) {
                if !self.bindings.has_grad(key) || grad_ptrs.contains_key(key) {
                    continue;
                }
                if let Some(dims) = self.shapes.lookup(key)?.dims() {
                    let array = HostArray::zeros(dims.to_vec());
                    grad_ptrs.insert(key.clone(), array.as_record_ptr());
                    scratch.push(array);
                }
            }
        }

        let mut pointers: BTreeMap<String, *mut CArray> = BTreeMap::new();
        for (key, value) in params.iter().chain(data.iter()) {
            pointers.insert(key.clone(), value.as_record_ptr());
        }
        for (key, pointer) in &grad_ptrs {
            pointers.insert(format!("{key}{GRAD_SUFFIX}"), *pointer);
        }
        for (key, value) in &forward {
            pointers.insert(key.clone(), value.as_record_ptr());
        }

        let block = self.marshal_block(&self.grad_input_layout, &pointers, false)?;
        let mut out_block: Vec<*mut CArray> =
            vec![ptr::null_mut(); self.grad_output_layout.len()];
        unsafe { gradients_fn(block.as_ptr(), out_block.as_mut_ptr()) };
        drop(scratch);

        let mut gradients = ArrayMap::new();
        for (field, pointer) in self.grad_output_layout.unmarshal(&out_block) {
            let base = field.strip_suffix(GRAD_SUFFIX).unwrap_or(field).to_string();
            let Some(dims) = self.shapes.known_dims(&base)? else {
                continue;
            };
            let record = NonNull::new(pointer).ok_or_else(|| BridgeError::NullOutput {
                key: field.to_string(),
            })?;
            gradients.insert(base, unsafe { HostArray::from_foreign(record, dims) });
        }

        let mut outputs = ArrayMap::new();
        let mut forward = forward;
        for key in &self.bindings.output_keys {
            if let Some(value) = forward.remove(key) {
                outputs.insert(key.clone(), value);
            }
        }
        Ok((outputs, gradients))
    }

    /// Builds the positional pointer block for one generated input struct.
    /// Fields without supplied storage, and fields whose shape is
    /// statically unknown, marshal as null; a shape-table miss for a
    /// supplied field is an internal-consistency failure and propagates.
    fn marshal_block(
        &self,
        layout: &StructLayout,
        pointers: &BTreeMap<String, *mut CArray>,
        skip_final_cost: bool,
    ) -> BridgeResult<Vec<*mut CArray>> {
        let mut block = Vec::with_capacity(layout.len());
        for field in layout.fields() {
            if skip_final_cost && field.as_str() == FINAL_COST_KEY {
                block.push(ptr::null_mut());
                continue;
            }
            match pointers.get(field) {
                Some(pointer) if self.shapes.lookup(field)?.is_known() => block.push(*pointer),
                _ => block.push(ptr::null_mut()),
            }
        }
        Ok(block)
    }
}

fn fingerprint(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}
