use std::collections::BTreeSet;

use gradc::codegen::c_ast::Expr;
use gradc::codegen::{CodeGenerator, CodegenHooks, Context};
use gradc::{
    CodegenConfig, CodegenError, FlatGraph, FlatGraphBuilder, GraphBindings, Operator,
    PrimitiveRegistry, SourceValue, FINAL_COST_KEY,
};

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// `act = relu(w * x + b)` with a cotangent on `act`.
fn relu_chain() -> (FlatGraph, GraphBindings) {
    let mut builder = FlatGraphBuilder::new();
    builder.add_operator(Operator::new(
        "multiplication",
        "prod",
        vec![SourceValue::key("w"), SourceValue::key("x")],
    ));
    builder.add_operator(Operator::new(
        "add",
        "sum",
        vec![SourceValue::key("prod"), SourceValue::key("b")],
    ));
    builder.add_operator(Operator::new("relu", "act", vec![SourceValue::key("sum")]));
    let bindings = GraphBindings {
        input_keys: keys(&["w", "x", "b"]),
        output_keys: vec!["act".to_string()],
        cotangent_keys: keys(&["act"]),
        differentiable_keys: keys(&["w", "x", "b", "prod", "sum", "act"]),
        inference: false,
    };
    let graph = builder.finish(&bindings).unwrap();
    (graph, bindings)
}

/// One tensor feeding two consumers, summed into an attached final cost.
fn shared_subexpression() -> (FlatGraph, GraphBindings) {
    let mut builder = FlatGraphBuilder::new();
    builder.add_operator(Operator::new("relu", "t", vec![SourceValue::key("x")]));
    builder.add_operator(Operator::new("exp", "a", vec![SourceValue::key("t")]));
    builder.add_operator(Operator::new("tanh", "b2", vec![SourceValue::key("t")]));
    builder.add_operator(Operator::new(
        "add",
        "loss",
        vec![SourceValue::key("a"), SourceValue::key("b2")],
    ));
    builder.alias_output(FINAL_COST_KEY, "loss");
    let bindings = GraphBindings {
        input_keys: keys(&["x"]),
        output_keys: vec!["loss".to_string()],
        cotangent_keys: BTreeSet::new(),
        differentiable_keys: keys(&["x", "t", "a", "b2", "loss"]),
        inference: false,
    };
    let graph = builder.finish(&bindings).unwrap();
    (graph, bindings)
}

fn generate(graph: &FlatGraph, bindings: &GraphBindings, config: &CodegenConfig) -> String {
    let registry = PrimitiveRegistry::standard();
    let hooks = CodegenHooks::new();
    CodeGenerator::new(graph, bindings, config, registry, &hooks)
        .generate_source()
        .expect("generation succeeds")
        .code
}

#[test]
fn generated_source_is_byte_identical_across_runs() {
    let (graph, bindings) = relu_chain();
    let config = CodegenConfig::default();
    let first = generate(&graph, &bindings, &config);
    let second = generate(&graph, &bindings, &config);
    assert_eq!(first, second);
}

#[test]
fn forward_pass_follows_topological_order() {
    let (graph, bindings) = relu_chain();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    let prod = code.find("cache.prod = multiplication(inputs->w, inputs->x);");
    let sum = code.find("cache.sum = add(cache.prod, inputs->b);");
    let act = code.find("cache.act = relu(cache.sum);");
    assert!(prod.is_some() && sum.is_some() && act.is_some(), "{code}");
    assert!(prod < sum && sum < act);
    assert!(code.contains("struct eval_outputs output_struct = {.act = cache.act};"));
}

#[test]
fn struct_fields_are_sorted_and_pointer_typed() {
    let (graph, bindings) = relu_chain();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    assert!(code.contains(
        "struct eval_inputs\n{\n    Array *b;\n    Array *w;\n    Array *x;\n};"
    ));
    assert!(code.contains(
        "struct model_cache\n{\n    Array *act;\n    Array *prod;\n    Array *sum;\n};"
    ));
    assert!(code.contains(
        "static struct model_cache cache = {.act = NULL, .prod = NULL, .sum = NULL};"
    ));
}

#[test]
fn gradient_pass_walks_the_graph_in_reverse() {
    let (graph, bindings) = relu_chain();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    let relu = code.find("sum_grad = relu_grad(inputs->act_grad, 0, cache.act, cache.sum);");
    let add0 = code.find("prod_grad = add_grad(sum_grad, 0, cache.sum, cache.prod, inputs->b);");
    let add1 = code.find("b_grad = add_grad(sum_grad, 1, cache.sum, cache.prod, inputs->b);");
    let mul0 = code.find(
        "w_grad = multiplication_grad(prod_grad, 0, cache.prod, inputs->w, inputs->x);",
    );
    assert!(
        relu.is_some() && add0.is_some() && add1.is_some() && mul0.is_some(),
        "{code}"
    );
    assert!(relu < add0 && add0 < add1 && add1 < mul0);
    // Cotangent locals are predeclared and null-initialized.
    assert!(code.contains("Array *sum_grad = NULL;"));
    assert!(code.contains(
        "struct eval_grad_outputs output_struct = {.b_grad = b_grad, .w_grad = w_grad, .x_grad = x_grad};"
    ));
}

#[test]
fn shared_subexpression_accumulates_gradients() {
    let (graph, bindings) = shared_subexpression();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    // `t` feeds both `exp` and `tanh`, so each contribution accumulates.
    assert!(code.contains("t_grad = accumulate_grads(exp_grad(a_grad, 0, cache.a, cache.t), t_grad);"));
    assert!(code.contains(
        "t_grad = accumulate_grads(tanh_grad(b2_grad, 0, cache.b2, cache.t), t_grad);"
    ));
    // Single-consumer keys assign directly.
    assert!(code.contains("x_grad = relu_grad(t_grad, 0, cache.t, inputs->x);"));
    assert!(!code.contains("x_grad = accumulate_grads"));
}

#[test]
fn final_cost_seeds_through_its_alias() {
    let (graph, bindings) = shared_subexpression();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    // The cotangent of the loss-producing key arrives under the sentinel
    // name, and the forward value reference resolves through the alias.
    assert!(code.contains("a_grad = add_grad(inputs->final_cost_grad, 0, cache.loss, cache.a, cache.b2);"));
}

#[test]
fn inference_graph_omits_gradient_artifacts() {
    let (graph, mut bindings) = relu_chain();
    bindings.inference = true;
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    assert!(!code.contains("evaluate_gradients"));
    assert!(!code.contains("eval_grad_inputs"));
    assert!(!code.contains("static struct eval_grad_outputs"));
}

#[test]
fn gradient_request_without_seed_is_a_config_error() {
    let (graph, mut bindings) = relu_chain();
    bindings.cotangent_keys.clear();
    let registry = PrimitiveRegistry::standard();
    let hooks = CodegenHooks::new();
    let config = CodegenConfig::default();
    let err = CodeGenerator::new(&graph, &bindings, &config, registry, &hooks)
        .generate_source()
        .unwrap_err();
    assert!(matches!(err, CodegenError::Config(_)));
}

#[test]
fn unregistered_primitive_is_rejected_before_rendering() {
    let mut builder = FlatGraphBuilder::new();
    builder.add_operator(Operator::new(
        "septic_blur",
        "y",
        vec![SourceValue::key("x")],
    ));
    let bindings = GraphBindings {
        input_keys: keys(&["x"]),
        output_keys: vec!["y".to_string()],
        inference: true,
        ..GraphBindings::default()
    };
    let graph = builder.finish(&bindings).unwrap();
    let registry = PrimitiveRegistry::standard();
    let hooks = CodegenHooks::new();
    let config = CodegenConfig::default();
    let err = CodeGenerator::new(&graph, &bindings, &config, registry, &hooks)
        .generate_source()
        .unwrap_err();
    assert!(matches!(err, CodegenError::UnsupportedPrimitive { .. }));
}

#[test]
fn use_output_as_input_passes_output_storage_first() {
    let (graph, mut bindings) = relu_chain();
    bindings.inference = true;
    let config = CodegenConfig {
        use_output_as_input: true,
        ..CodegenConfig::default()
    };
    let code = generate(&graph, &bindings, &config);
    // The kernel receives the target's storage as its leading argument;
    // internal keys still resolve through the persistent cache.
    assert!(code.contains("cache.prod = multiplication(cache.prod, inputs->w, inputs->x);"));
    // Every graph key is a field of the widened input struct.
    assert!(code.contains(
        "struct eval_inputs\n{\n    Array *act;\n    Array *b;\n    Array *prod;\n    Array *sum;\n    Array *w;\n    Array *x;\n};"
    ));
}

#[test]
fn entry_shims_are_emitted_for_the_bridge() {
    let (graph, bindings) = relu_chain();
    let code = generate(&graph, &bindings, &CodegenConfig::default());
    assert!(code.contains(
        "void evaluate_into(struct eval_inputs *inputs, struct eval_outputs *outputs)"
    ));
    assert!(code.contains("*outputs = evaluate(inputs);"));
    assert!(code.contains(
        "void evaluate_gradients_into(struct eval_grad_inputs *inputs, struct eval_grad_outputs *outputs)"
    ));
}

#[test]
fn key_references_resolve_by_role() {
    let (graph, bindings) = relu_chain();
    let registry = PrimitiveRegistry::standard();
    let hooks = CodegenHooks::new();
    let config = CodegenConfig::default();
    let generator = CodeGenerator::new(&graph, &bindings, &config, registry, &hooks);
    assert_eq!(
        generator.create_key_ref("prod", Context::Eval),
        Expr::var("cache.prod")
    );
    assert_eq!(
        generator.create_key_ref("w", Context::Eval),
        Expr::arrow(Expr::var("inputs"), "w")
    );
    assert_eq!(
        generator.create_key_ref("w_grad", Context::EvalGrad),
        Expr::var("w_grad")
    );
}
