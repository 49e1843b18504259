//! End-to-end compilation of a small classifier on both targets.

use calibra::calibrate::{
    CalibrationConfig, CalibrationTable, Datum, Normalization, Record, RecordStore,
    ReferenceOracle,
};
use calibra::ir::lower::LowerError;
use calibra::ir::DType;
use calibra::isel::InstOp;
use calibra::onnx::{Attribute, ElemType, Graph, Initializer, Model, Node, ValueInfo};
use calibra::pipeline::{add_dummy_weights, compile, CompileError, CompileOptions};
use calibra::TargetConfig;

/// data[1,1,6,6] -> Conv(2x3x3, pad 1) -> Relu -> MaxPool 2x2/2 -> Flatten
/// -> Gemm(W[4,18], transB) -> Softmax
fn classifier() -> Model {
    let nodes = vec![
        Node::new("Conv")
            .named("conv1")
            .input("data")
            .input("w")
            .input("b")
            .output("conv1")
            .attr("kernel_shape", Attribute::Ints(vec![3, 3]))
            .attr("pads", Attribute::Ints(vec![1, 1, 1, 1])),
        Node::new("Relu").input("conv1").output("relu1"),
        Node::new("MaxPool")
            .input("relu1")
            .output("pool1")
            .attr("kernel_shape", Attribute::Ints(vec![2, 2]))
            .attr("strides", Attribute::Ints(vec![2, 2])),
        Node::new("Flatten").input("pool1").output("flat"),
        Node::new("Gemm")
            .input("flat")
            .input("fc_w")
            .input("fc_b")
            .output("fc")
            .attr("transB", Attribute::Int(1)),
        Node::new("Softmax").input("fc").output("prob"),
    ];
    Model {
        producer_name: "test".into(),
        opset_version: 9,
        graph: Graph {
            name: "classifier".into(),
            nodes,
            initializers: vec![
                Initializer::float("w", vec![2, 1, 3, 3], vec![0.1; 18]),
                Initializer::float("b", vec![2], vec![0.0; 2]),
                Initializer::float("fc_w", vec![4, 18], vec![0.05; 72]),
                Initializer::float("fc_b", vec![4], vec![0.0; 4]),
            ],
            inputs: vec![ValueInfo::new("data", ElemType::Float, vec![1, 1, 6, 6])],
            outputs: vec![ValueInfo::new("prob", ElemType::Float, vec![1, 4])],
            value_info: Vec::new(),
        },
    }
}

fn dataset() -> RecordStore {
    RecordStore::new(
        (0..4)
            .map(|n| Record {
                key: format!("{:08}", n),
                datum: Datum {
                    channels: 1,
                    height: 6,
                    width: 6,
                    label: n,
                    data: (0..36u32)
                        .map(|i| ((i * 7 + n as u32 * 13) % 200 + 20) as u8)
                        .collect(),
                },
            })
            .collect(),
    )
}

fn int8_options() -> CompileOptions {
    CompileOptions {
        calibration: CalibrationConfig {
            iterations: 2,
            normalization: Normalization::Scale { divisor: 256.0 },
            ..CalibrationConfig::default()
        },
        ..CompileOptions::default()
    }
}

#[test]
fn test_bm1880_compiles_calibrated_int8() {
    let store = dataset();
    let compiled = compile(&classifier(), &int8_options(), Some(&store), &ReferenceOracle).unwrap();

    let kinds: Vec<&str> = compiled
        .selection
        .instructions
        .iter()
        .map(|i| i.type_name())
        .collect();
    assert_eq!(kinds, vec!["conv", "relu", "maxpool", "fc", "softmax"]);
    assert!(compiled
        .diagnostics
        .iter()
        .any(|d| d.subject.as_deref() == Some("flat") && d.message.contains("Flatten")));

    let table = compiled.table.as_ref().unwrap();
    assert_eq!(table.layers[0].name, "data");
    assert_eq!(table.layers.len(), 7);
    let conv = table.layer("conv1").unwrap().output().unwrap();
    assert!(conv.right_shift.is_some());
    let pool = table.layer("pool1").unwrap().output().unwrap();
    assert!(pool.right_shift.is_some() && pool.multiplier.is_some());

    let fc = &compiled.selection.instructions[3];
    assert!(matches!(fc.op, InstOp::Fc { trans_b: true, has_bias: true }));
    assert!(fc.quant.as_ref().unwrap().right_shift.is_some());

    let g = &compiled.graph;
    assert_eq!(g.tensor(g.find("w").unwrap()).dtype, DType::I8);
    assert_eq!(g.tensor(g.find("fc_b").unwrap()).dtype, DType::I16);
    assert_eq!(g.tensor(g.find("relu1").unwrap()).dtype, DType::I8);
    // int8 weights (18 + 72) and int16 biases (2 + 4)
    assert_eq!(compiled.weight_blob().len(), 18 + 72 + 2 * (2 + 4));
}

#[test]
fn test_bm1680_compiles_without_calibration() {
    let options = CompileOptions {
        target: TargetConfig::bm1680(),
        ..CompileOptions::default()
    };
    let compiled = compile(&classifier(), &options, None, &ReferenceOracle).unwrap();
    assert!(compiled.table.is_none());
    assert_eq!(compiled.selection.instructions.len(), 5);
    assert!(compiled
        .selection
        .instructions
        .iter()
        .all(|i| i.quant.is_none()));
    assert_eq!(compiled.weight_blob().len(), (18 + 2 + 72 + 4) * 4);
}

#[test]
fn test_reused_table_reproduces_weights() {
    let store = dataset();
    let first = compile(&classifier(), &int8_options(), Some(&store), &ReferenceOracle).unwrap();
    let json = first.table.as_ref().unwrap().to_json().unwrap();

    let options = CompileOptions {
        ctable: Some(CalibrationTable::from_json(&json).unwrap()),
        ..int8_options()
    };
    let second = compile(&classifier(), &options, None, &ReferenceOracle).unwrap();
    assert_eq!(second.weight_blob(), first.weight_blob());
    assert_eq!(second.selection.listing(), first.selection.listing());
}

#[test]
fn test_stale_table_is_rejected() {
    let mut table = CalibrationTable::default();
    table.model_digest = "0000".into();
    let options = CompileOptions {
        ctable: Some(table),
        ..CompileOptions::default()
    };
    let err = compile(&classifier(), &options, None, &ReferenceOracle).unwrap_err();
    assert!(matches!(err, CompileError::StaleTable { .. }));
}

#[test]
fn test_skipping_calibration_needs_dummy_table() {
    let options = CompileOptions {
        ignore_calibration: true,
        ..CompileOptions::default()
    };
    let err = compile(&classifier(), &options, None, &ReferenceOracle).unwrap_err();
    assert!(matches!(err, CompileError::NoCalibration { .. }));

    let options = CompileOptions {
        ignore_calibration: true,
        dummy_ctable: true,
        ..CompileOptions::default()
    };
    let compiled = compile(&classifier(), &options, None, &ReferenceOracle).unwrap();
    assert_eq!(compiled.selection.instructions.len(), 5);
    let conv = compiled.selection.instructions[0].quant.as_ref().unwrap();
    assert_eq!(conv.threshold_y, 1.0);
    assert_eq!(conv.right_shift, Some(0));
}

#[test]
fn test_missing_dataset_is_fatal() {
    let err = compile(&classifier(), &int8_options(), None, &ReferenceOracle).unwrap_err();
    assert!(matches!(err, CompileError::NoCalibration { .. }));
}

#[test]
fn test_unsupported_node_aborts() {
    let mut model = classifier();
    model
        .graph
        .nodes
        .push(Node::new("Gather").input("prob").output("picked"));
    let options = CompileOptions {
        target: TargetConfig::bm1680(),
        ..CompileOptions::default()
    };
    let err = compile(&model, &options, None, &ReferenceOracle).unwrap_err();
    assert!(matches!(
        err,
        CompileError::Lower(LowerError::Unsupported { .. })
    ));
}

#[test]
fn test_dummy_weights_fill_declared_inputs() {
    let mut model = classifier();
    model.graph.initializers.retain(|i| i.name != "w");
    model
        .graph
        .inputs
        .push(ValueInfo::new("w", ElemType::Float, vec![2, 1, 3, 3]));

    let mut graph = model.graph.clone();
    let diags = add_dummy_weights(&mut graph);
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].subject.as_deref(), Some("w"));
    let w = graph.initializer("w").unwrap();
    assert_eq!(w.dims, vec![2, 1, 3, 3]);
    assert_eq!(w.data.len(), 18);

    let options = CompileOptions {
        target: TargetConfig::bm1680(),
        dummy_weight: true,
        ..CompileOptions::default()
    };
    let compiled = compile(&model, &options, None, &ReferenceOracle).unwrap();
    let w = compiled.graph.find("w").unwrap();
    assert!(compiled.graph.tensor(w).is_constant());
}

#[test]
fn test_dummy_weights_need_a_table_on_int8() {
    let mut model = classifier();
    model.graph.initializers.retain(|i| i.name != "w");
    model
        .graph
        .inputs
        .push(ValueInfo::new("w", ElemType::Float, vec![2, 1, 3, 3]));
    let store = dataset();

    let options = CompileOptions {
        dummy_weight: true,
        ..int8_options()
    };
    let err = compile(&model, &options, Some(&store), &ReferenceOracle).unwrap_err();
    assert!(matches!(err, CompileError::DummyWeightCalibration));

    let options = CompileOptions {
        dummy_weight: true,
        ignore_calibration: true,
        dummy_ctable: true,
        ..int8_options()
    };
    let compiled = compile(&model, &options, None, &ReferenceOracle).unwrap();
    assert_eq!(compiled.selection.instructions.len(), 5);
}
