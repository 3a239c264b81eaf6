//! End-to-end tests driving a real C compiler: generate source, build a
//! shared library against the kernel header in `testdata/`, load it, and
//! check the numbers that come back. Skipped when no C compiler is on PATH.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Result;
use gradc::codegen::CodegenHooks;
use gradc::{
    CodegenConfig, FlatGraphBuilder, GraphBindings, Operator, PrimitiveRegistry, ShapeTable,
    SourceValue, FINAL_COST_KEY,
};
use gradc_backend_c::{ArrayMap, BridgeError, CompiledModel, HostArray};

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn testdata_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata")
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gradc_native_{}_{name}.c", std::process::id()))
}

fn compiler_available() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn test_config() -> CodegenConfig {
    CodegenConfig {
        src_path: testdata_dir(),
        ..CodegenConfig::default()
    }
}

/// `loss = reduce_sum(relu(w * x + b))` with the final cost attached.
fn loss_model(source_name: &str) -> CompiledModel {
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
    builder.add_operator(Operator::new(
        "reduce_sum",
        "loss",
        vec![SourceValue::key("act")],
    ));
    builder.alias_output(FINAL_COST_KEY, "loss");

    let bindings = GraphBindings {
        input_keys: keys(&["w", "x", "b"]),
        output_keys: vec!["loss".to_string()],
        cotangent_keys: BTreeSet::new(),
        differentiable_keys: keys(&["w", "x", "b", "prod", "sum", "act", "loss"]),
        inference: false,
    };
    let graph = builder.finish(&bindings).expect("acyclic");

    let mut shapes = ShapeTable::new();
    for key in ["w", "x", "b", "prod", "sum", "act"] {
        shapes.insert(key, vec![4]);
    }
    shapes.insert("loss", vec![1]);

    CompiledModel::compile(
        graph,
        bindings,
        shapes,
        test_config(),
        PrimitiveRegistry::standard(),
        &CodegenHooks::new(),
        Some(scratch_path(source_name)),
    )
    .expect("compile succeeds")
}

fn inputs() -> (ArrayMap, ArrayMap) {
    let mut params = ArrayMap::new();
    params.insert("w".to_string(), HostArray::from_slice(&[1.0, 2.0, 3.0, 4.0], vec![4]));
    params.insert(
        "b".to_string(),
        HostArray::from_slice(&[-10.0, 0.0, 1.0, 2.0], vec![4]),
    );
    let mut data = ArrayMap::new();
    data.insert("x".to_string(), HostArray::from_slice(&[2.0, 2.0, 2.0, 2.0], vec![4]));
    (params, data)
}

#[test]
fn forward_pass_computes_the_loss() -> Result<()> {
    if !compiler_available() {
        eprintln!("skipping: no C compiler on PATH");
        return Ok(());
    }
    let model = loss_model("forward");
    assert!(model.source_path().exists());

    let (params, data) = inputs();
    let outputs = model.evaluate(&params, &data, &ArrayMap::new(), false)?;

    // prod = [2,4,6,8], sum = [-8,4,7,10], act = [0,4,7,10], loss = 21.
    assert_eq!(outputs["loss"].as_slice(), &[21.0]);
    // The final-cost sentinel surfaces the same scalar.
    assert_eq!(outputs[FINAL_COST_KEY].as_slice(), &[21.0]);
    Ok(())
}

#[test]
fn gradients_seed_through_the_final_cost() -> Result<()> {
    if !compiler_available() {
        eprintln!("skipping: no C compiler on PATH");
        return Ok(());
    }
    let model = loss_model("gradients");
    let (params, data) = inputs();
    let (outputs, gradients) = model.evaluate_gradients(&params, &data, None)?;

    assert_eq!(outputs["loss"].as_slice(), &[21.0]);
    // d(loss)/d(act) broadcasts the unit seed; relu masks the lane where
    // sum is negative, then the product rule splits across w and x.
    assert_eq!(gradients["b"].as_slice(), &[0.0, 1.0, 1.0, 1.0]);
    assert_eq!(gradients["w"].as_slice(), &[0.0, 2.0, 2.0, 2.0]);
    assert_eq!(gradients["x"].as_slice(), &[0.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn shared_consumer_gradients_accumulate() -> Result<()> {
    if !compiler_available() {
        eprintln!("skipping: no C compiler on PATH");
        return Ok(());
    }
    // d = t * t with t = relu(x): t has two consumers (both slots of the
    // multiplication), so its cotangent is the sum of both contributions.
    let mut builder = FlatGraphBuilder::new();
    builder.add_operator(Operator::new("relu", "t", vec![SourceValue::key("x")]));
    builder.add_operator(Operator::new(
        "multiplication",
        "d",
        vec![SourceValue::key("t"), SourceValue::key("t")],
    ));
    let bindings = GraphBindings {
        input_keys: keys(&["x"]),
        output_keys: vec!["d".to_string()],
        cotangent_keys: keys(&["d"]),
        differentiable_keys: keys(&["x", "t", "d"]),
        inference: false,
    };
    let graph = builder.finish(&bindings).expect("acyclic");

    let mut shapes = ShapeTable::new();
    for key in ["x", "t", "d"] {
        shapes.insert(key, vec![4]);
    }

    let model = CompiledModel::compile(
        graph,
        bindings,
        shapes,
        test_config(),
        PrimitiveRegistry::standard(),
        &CodegenHooks::new(),
        Some(scratch_path("accumulate")),
    )
    .expect("compile succeeds");

    let params = ArrayMap::new();
    let mut data = ArrayMap::new();
    data.insert(
        "x".to_string(),
        HostArray::from_slice(&[-1.0, 1.0, 2.0, 3.0], vec![4]),
    );
    let mut seeds = ArrayMap::new();
    seeds.insert("d".to_string(), HostArray::ones(vec![4]));

    let (outputs, gradients) = model.evaluate_gradients(&params, &data, Some(&seeds))?;

    assert_eq!(outputs["d"].as_slice(), &[0.0, 1.0, 4.0, 9.0]);
    // d(t*t)/dt = 2t, masked by relu at the negative lane.
    assert_eq!(gradients["x"].as_slice(), &[0.0, 2.0, 4.0, 6.0]);
    Ok(())
}

#[test]
fn impossible_gradient_request_writes_no_artifacts() {
    // No compiler needed: the request must fail before any file exists.
    let mut builder = FlatGraphBuilder::new();
    builder.add_operator(Operator::new("relu", "y", vec![SourceValue::key("x")]));
    let bindings = GraphBindings {
        input_keys: keys(&["x"]),
        output_keys: vec!["y".to_string()],
        cotangent_keys: BTreeSet::new(),
        differentiable_keys: keys(&["x", "y"]),
        inference: false,
    };
    let graph = builder.finish(&bindings).expect("acyclic");
    let mut shapes = ShapeTable::new();
    shapes.insert("x", vec![4]);
    shapes.insert("y", vec![4]);

    let source_path = scratch_path("rejected");
    let Err(err) = CompiledModel::compile(
        graph,
        bindings,
        shapes,
        test_config(),
        PrimitiveRegistry::standard(),
        &CodegenHooks::new(),
        Some(source_path.clone()),
    ) else {
        panic!("gradient request without a seed must fail");
    };

    assert!(matches!(err, BridgeError::Codegen(_)), "{err}");
    assert!(!source_path.exists());
}
