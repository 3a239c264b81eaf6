//! Source generation: builds the forward and reverse-mode gradient functions
//! over a flat graph and prints them through the C AST.

pub mod c_ast;
mod hooks;
mod struct_keys;

pub use hooks::{CodegenHooks, PostProcessor, PreProcessor};
pub use struct_keys::StructKeys;

use std::collections::BTreeSet;

use c_ast::{
    CFile, CType, Constant, Expr, FunctionDef, GlobalItem, Include, Parameter, Stmt, StructDef,
    StructField, StructInit,
};

use crate::config::CodegenConfig;
use crate::error::{CodegenError, CodegenResult};
use crate::graph::{FlatGraph, GraphBindings, Operator, SourceValue};
use crate::primitives::PrimitiveRegistry;
use crate::{FINAL_COST_KEY, GRAD_SUFFIX};

pub const EVAL_INPUT_STRUCT: &str = "eval_inputs";
pub const EVAL_OUTPUT_STRUCT: &str = "eval_outputs";
pub const CACHE_STRUCT: &str = "model_cache";
pub const GRAD_INPUT_STRUCT: &str = "eval_grad_inputs";
pub const GRAD_OUTPUT_STRUCT: &str = "eval_grad_outputs";

/// Name of the persistent cache instance in the generated unit. The cache
/// is deliberately a single static per translation unit: one loaded library
/// owns exactly one in-flight evaluation at a time.
pub const CACHE_NAME: &str = "cache";
pub const GRAD_STORE_NAME: &str = "grads";

pub const EVALUATE_FN: &str = "evaluate";
pub const EVALUATE_GRADIENTS_FN: &str = "evaluate_gradients";

/// ABI-stable entry shims. `evaluate` returns its output struct by value,
/// which a host cannot call without knowing the struct size at compile
/// time; the shims take an out-pointer instead and are what the bridge
/// actually resolves.
pub const EVALUATE_SHIM_FN: &str = "evaluate_into";
pub const EVALUATE_GRADIENTS_SHIM_FN: &str = "evaluate_gradients_into";

/// Name of the accumulation kernel wrapping backward calls whose target
/// receives contributions from more than one consumer.
pub const ACCUMULATE_FN: &str = "accumulate_grads";

/// Which function body a key reference is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Eval,
    EvalGrad,
}

/// Output of [`CodeGenerator::generate_source`].
#[derive(Debug, Clone)]
pub struct GeneratedSource {
    pub code: String,
    pub struct_keys: StructKeys,
}

/// Builds one translation unit from a flat graph.
///
/// Pure with respect to its inputs: generating twice from the same graph,
/// bindings and configuration yields byte-identical source. All
/// backend-specific behavior arrives through [`CodegenConfig`],
/// [`PrimitiveRegistry`] and [`CodegenHooks`].
pub struct CodeGenerator<'a> {
    graph: &'a FlatGraph,
    bindings: &'a GraphBindings,
    config: &'a CodegenConfig,
    registry: &'a PrimitiveRegistry,
    hooks: &'a CodegenHooks,
    struct_keys: StructKeys,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(
        graph: &'a FlatGraph,
        bindings: &'a GraphBindings,
        config: &'a CodegenConfig,
        registry: &'a PrimitiveRegistry,
        hooks: &'a CodegenHooks,
    ) -> Self {
        let struct_keys = StructKeys::determine(graph, bindings, config);
        Self {
            graph,
            bindings,
            config,
            registry,
            hooks,
            struct_keys,
        }
    }

    pub fn struct_keys(&self) -> &StructKeys {
        &self.struct_keys
    }

    /// Validates that the requested configuration can succeed at all.
    /// Called before any source is generated so that impossible requests
    /// never reach the compiler subprocess.
    pub fn validate(&self) -> CodegenResult<()> {
        if !self.bindings.inference
            && !self.graph.output_dict().contains_key(FINAL_COST_KEY)
            && self.bindings.cotangent_keys.is_empty()
        {
            return Err(CodegenError::config(
                "gradient generation requires a final-cost output or declared cotangent keys",
            ));
        }
        for key in self.graph.topological_order() {
            let op = self.op_for(key)?;
            self.registry.resolve(&op.formula_key)?;
            if !self.bindings.inference && self.bindings.has_grad(key) {
                self.registry.resolve_backward(&op.formula_key)?;
            }
        }
        Ok(())
    }

    /// Renders the full translation unit: include, struct definitions,
    /// static cache/gradient globals, `evaluate`, `evaluate_gradients`
    /// (unless inference-only) and the ABI shims, in that order.
    pub fn generate_source(&self) -> CodegenResult<GeneratedSource> {
        self.validate()?;

        let mut file = CFile::default();
        let header = self.config.src_path.join(&self.config.header_name);
        file.includes
            .push(Include::local(header.display().to_string()));

        self.generate_structs(&mut file.globals);
        self.initialize_global_structs(&mut file.globals);

        file.functions.push(self.generate_evaluate()?);
        if !self.bindings.inference {
            file.functions.push(self.generate_evaluate_gradients()?);
        }
        file.functions.push(self.entry_shim(
            EVALUATE_SHIM_FN,
            EVALUATE_FN,
            EVAL_INPUT_STRUCT,
            EVAL_OUTPUT_STRUCT,
        ));
        if !self.bindings.inference {
            file.functions.push(self.entry_shim(
                EVALUATE_GRADIENTS_SHIM_FN,
                EVALUATE_GRADIENTS_FN,
                GRAD_INPUT_STRUCT,
                GRAD_OUTPUT_STRUCT,
            ));
        }

        Ok(GeneratedSource {
            code: file.render(),
            struct_keys: self.struct_keys.clone(),
        })
    }

    fn op_for(&self, output_key: &str) -> CodegenResult<&Operator> {
        self.graph.get_op(output_key).ok_or_else(|| {
            CodegenError::config(format!("no operator produces key '{output_key}'"))
        })
    }

    fn array_ptr(&self) -> CType {
        CType::pointer_to(CType::named(&self.config.array_type))
    }

    fn generate_structs(&self, globals: &mut Vec<GlobalItem>) {
        let mut push = |name: &str, keys: &[String]| {
            globals.push(GlobalItem::Struct(self.generate_struct(name, keys)));
        };
        push(EVAL_INPUT_STRUCT, &self.struct_keys.eval_input_keys);
        push(EVAL_OUTPUT_STRUCT, &self.struct_keys.eval_output_keys);
        push(CACHE_STRUCT, &self.struct_keys.eval_cache_keys);
        if !self.bindings.inference {
            push(GRAD_INPUT_STRUCT, &self.struct_keys.eval_grad_input_keys);
            push(GRAD_OUTPUT_STRUCT, &self.struct_keys.eval_grad_output_keys);
        }
    }

    fn generate_struct(&self, name: &str, field_keys: &[String]) -> StructDef {
        // Field order is the sorted key order handed over by the
        // classifier; the bridge recomputes the identical order.
        StructDef {
            name: name.to_string(),
            fields: field_keys
                .iter()
                .map(|key| StructField {
                    ty: self.array_ptr(),
                    name: key.clone(),
                })
                .collect(),
        }
    }

    fn initialize_global_structs(&self, globals: &mut Vec<GlobalItem>) {
        globals.push(GlobalItem::Init(StructInit {
            struct_type: CACHE_STRUCT.to_string(),
            name: CACHE_NAME.to_string(),
            fields: self
                .struct_keys
                .eval_cache_keys
                .iter()
                .map(|key| (key.clone(), Expr::null()))
                .collect(),
            is_static: true,
        }));
        if !self.bindings.inference {
            globals.push(GlobalItem::Init(StructInit {
                struct_type: GRAD_OUTPUT_STRUCT.to_string(),
                name: GRAD_STORE_NAME.to_string(),
                fields: self
                    .struct_keys
                    .eval_grad_output_keys
                    .iter()
                    .map(|key| (key.clone(), Expr::null()))
                    .collect(),
                is_static: true,
            }));
        }
    }

    fn generate_evaluate(&self) -> CodegenResult<FunctionDef> {
        let mut operations: Vec<Stmt> = Vec::new();
        for output_key in self.graph.topological_order() {
            let op = self.op_for(output_key)?;
            let mut inputs = op.sources.clone();
            // Some backends reuse the output buffer as a leading argument
            // instead of allocating inside the kernel.
            if self.config.use_output_as_input {
                inputs.insert(0, SourceValue::key(output_key.clone()));
            }
            let op_stmts = self.generate_op(op, inputs, output_key, Context::Eval, None, None)?;
            operations.extend(op_stmts);
        }

        operations.push(self.create_output_struct(Context::Eval));
        operations.push(Stmt::Return(Expr::var("output_struct")));

        Ok(FunctionDef {
            return_type: CType::struct_(EVAL_OUTPUT_STRUCT),
            name: EVALUATE_FN.to_string(),
            params: vec![Parameter::new(
                CType::pointer_to(CType::struct_(EVAL_INPUT_STRUCT)),
                "inputs",
            )],
            body: operations,
        })
    }

    fn generate_evaluate_gradients(&self) -> CodegenResult<FunctionDef> {
        let mut declarations: Vec<Stmt> = Vec::new();
        let mut declared: BTreeSet<String> = BTreeSet::new();
        let mut operations: Vec<Stmt> = Vec::new();

        for output_key in self.graph.topological_order().iter().rev() {
            // Statically inferred and unused values carry no gradient path.
            if !self.bindings.has_grad(output_key) {
                continue;
            }
            let op = self.op_for(output_key)?;
            let sources = self.graph.source_values(output_key);

            let output_ref_key = match self.graph.output_dict().get(FINAL_COST_KEY) {
                Some(mapped) if mapped == output_key => FINAL_COST_KEY.to_string(),
                _ => output_key.clone(),
            };

            for (idx, source) in sources.iter().enumerate() {
                let Some(input_key) = source.as_key() else {
                    continue;
                };
                if !self.bindings.has_grad(input_key) {
                    continue;
                }

                let mut fn_inputs: Vec<SourceValue> = vec![
                    SourceValue::key(format!("{output_ref_key}{GRAD_SUFFIX}")),
                    SourceValue::Int(idx as i64),
                    SourceValue::key(output_ref_key.clone()),
                ];
                fn_inputs.extend(sources.iter().cloned());
                if self.config.use_output_as_input {
                    for source in sources {
                        let Some(key) = source.as_key() else { continue };
                        if self.bindings.has_grad(key) {
                            fn_inputs.push(SourceValue::key(format!("{key}{GRAD_SUFFIX}")));
                        } else {
                            fn_inputs.push(SourceValue::Null);
                        }
                    }
                }

                let target_key = format!("{input_key}{GRAD_SUFFIX}");
                if self.is_local(&target_key) && declared.insert(target_key.clone()) {
                    declarations.push(Stmt::Declare {
                        ty: self.array_ptr(),
                        name: target_key.clone(),
                        init: Some(Expr::null()),
                    });
                }

                // Reverse-mode sums gradients over every path through a
                // shared sub-expression, so a key consumed more than once
                // accumulates into existing storage instead of overwriting
                // it.
                let accumulate =
                    self.graph.consumer_count(input_key) > 1 && !self.config.use_output_as_input;
                let target_ref = self.create_key_ref(&target_key, Context::EvalGrad);
                let post = move |_op: &Operator, op_call: Expr, _context: Context| {
                    (
                        Expr::call(ACCUMULATE_FN, vec![op_call, target_ref.clone()]),
                        Vec::<Stmt>::new(),
                    )
                };

                let op_stmts = self.generate_op(
                    op,
                    fn_inputs,
                    &target_key,
                    Context::EvalGrad,
                    None,
                    if accumulate { Some(&post) } else { None },
                )?;
                operations.extend(op_stmts);
            }
        }

        let mut body = declarations;
        body.append(&mut operations);
        body.push(self.create_output_struct(Context::EvalGrad));
        body.push(Stmt::Return(Expr::var("output_struct")));

        Ok(FunctionDef {
            return_type: CType::struct_(GRAD_OUTPUT_STRUCT),
            name: EVALUATE_GRADIENTS_FN.to_string(),
            params: vec![Parameter::new(
                CType::pointer_to(CType::struct_(GRAD_INPUT_STRUCT)),
                "inputs",
            )],
            body,
        })
    }

    /// Emits the statements for one primitive call: pre-processor
    /// injections, the assigned call expression, then post-processor
    /// injections. Default hooks registered for the formula key run before
    /// the call-site-specific override.
    fn generate_op(
        &self,
        op: &Operator,
        inputs: Vec<SourceValue>,
        output_key: &str,
        context: Context,
        pre_processor: Option<&dyn Fn(Operator, Vec<SourceValue>, Context) -> (Operator, Vec<SourceValue>, Vec<Stmt>)>,
        post_processor: Option<&dyn Fn(&Operator, Expr, Context) -> (Expr, Vec<Stmt>)>,
    ) -> CodegenResult<Vec<Stmt>> {
        let mut op = op.clone();
        let mut inputs = inputs;
        let mut pre_stmts: Vec<Stmt> = Vec::new();

        if let Some(default_pre) = self.hooks.pre(&op.formula_key) {
            let (new_op, new_inputs, stmts) = default_pre(op, inputs, context);
            op = new_op;
            inputs = new_inputs;
            pre_stmts.extend(stmts);
        }
        if let Some(pre) = pre_processor {
            let (new_op, new_inputs, stmts) = pre(op, inputs, context);
            op = new_op;
            inputs = new_inputs;
            pre_stmts.extend(stmts);
        }

        let args: Vec<Expr> = inputs
            .iter()
            .map(|input| match input {
                SourceValue::Key(key) => self.create_key_ref(key, context),
                SourceValue::Int(value) => Expr::Constant(Constant::Int(*value)),
                SourceValue::Float(value) => Expr::Constant(Constant::Float(*value)),
                SourceValue::Bool(value) => Expr::Constant(Constant::Bool(*value)),
                SourceValue::Null => Expr::null(),
            })
            .collect();

        let symbol = match context {
            Context::Eval => self.registry.resolve(&op.formula_key)?.forward_symbol.clone(),
            Context::EvalGrad => self.registry.resolve_backward(&op.formula_key)?.to_string(),
        };
        let mut op_call = Expr::call(symbol, args);

        let mut post_stmts: Vec<Stmt> = Vec::new();
        if let Some(default_post) = self.hooks.post(&op.formula_key) {
            let (new_call, stmts) = default_post(&op, op_call, context);
            op_call = new_call;
            post_stmts.extend(stmts);
        }
        if let Some(post) = post_processor {
            let (new_call, stmts) = post(&op, op_call, context);
            op_call = new_call;
            post_stmts.extend(stmts);
        }

        let assign = Stmt::Assign {
            target: self.create_key_ref(output_key, context),
            value: op_call,
        };

        let mut stmts = pre_stmts;
        stmts.push(assign);
        stmts.extend(post_stmts);
        Ok(stmts)
    }

    /// Three-way key reference resolution, applied identically here and in
    /// the bridge's field-name computation: cache keys dereference the
    /// persistent cache struct, input keys (per context) dereference the
    /// per-call input struct, everything else is a function-local variable.
    pub fn create_key_ref(&self, key: &str, context: Context) -> Expr {
        let resolved: &str = match self.graph.output_dict().get(FINAL_COST_KEY) {
            Some(mapped) if key == FINAL_COST_KEY => mapped.as_str(),
            _ => key,
        };
        if self.struct_keys.is_cache_key(resolved) {
            return Expr::var(format!("{CACHE_NAME}.{resolved}"));
        }
        match context {
            Context::Eval if self.struct_keys.is_eval_input(resolved) => {
                Expr::arrow(Expr::var("inputs"), resolved)
            }
            Context::EvalGrad if self.struct_keys.is_grad_input(resolved) => {
                Expr::arrow(Expr::var("inputs"), resolved)
            }
            _ => Expr::var(resolved),
        }
    }

    fn is_local(&self, key: &str) -> bool {
        !self.struct_keys.is_cache_key(key) && !self.struct_keys.is_grad_input(key)
    }

    fn create_output_struct(&self, context: Context) -> Stmt {
        let (struct_type, keys) = match context {
            Context::Eval => (EVAL_OUTPUT_STRUCT, &self.struct_keys.eval_output_keys),
            Context::EvalGrad => (GRAD_OUTPUT_STRUCT, &self.struct_keys.eval_grad_output_keys),
        };
        Stmt::StructInit(StructInit {
            struct_type: struct_type.to_string(),
            name: "output_struct".to_string(),
            fields: keys
                .iter()
                .map(|key| (key.clone(), self.create_key_ref(key, context)))
                .collect(),
            is_static: false,
        })
    }

    fn entry_shim(
        &self,
        shim_name: &str,
        entry_name: &str,
        input_struct: &str,
        output_struct: &str,
    ) -> FunctionDef {
        FunctionDef {
            return_type: CType::named("void"),
            name: shim_name.to_string(),
            params: vec![
                Parameter::new(CType::pointer_to(CType::struct_(input_struct)), "inputs"),
                Parameter::new(CType::pointer_to(CType::struct_(output_struct)), "outputs"),
            ],
            body: vec![Stmt::Assign {
                target: Expr::var("*outputs"),
                value: Expr::call(entry_name, vec![Expr::var("inputs")]),
            }],
        }
    }
}
