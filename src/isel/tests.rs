use super::*;
use crate::ir::{ConvAttrs, DType, PoolAttrs, TensorData, TensorKind};

/// data -> Conv -> conv -> Relu -> relu -> MaxPool -> pool -> Flatten -> flat
fn network() -> ComputeGraph {
    let mut g = ComputeGraph::new("net");
    let x = g.add_tensor("data", vec![1, 1, 4, 4], DType::F32, TensorKind::Input, None);
    g.mark_input(x);
    let w = g.add_tensor(
        "w",
        vec![1, 1, 1, 1],
        DType::F32,
        TensorKind::Initializer,
        Some(TensorData::F32(vec![0.5])),
    );
    let b = g.add_tensor(
        "b",
        vec![1],
        DType::F32,
        TensorKind::Initializer,
        Some(TensorData::F32(vec![0.0])),
    );
    let conv = g.add_tensor("conv", vec![1, 1, 4, 4], DType::F32, TensorKind::Value, None);
    let relu = g.add_tensor("relu", vec![1, 1, 4, 4], DType::F32, TensorKind::Value, None);
    let pool = g.add_tensor("pool", vec![1, 1, 2, 2], DType::F32, TensorKind::Value, None);
    let flat = g.add_tensor("flat", vec![1, 4], DType::F32, TensorKind::Value, None);
    g.add_operator(OpKind::Conv(ConvAttrs::default()), vec![x, w, b], vec![conv]);
    g.add_operator(OpKind::Relu, vec![conv], vec![relu]);
    g.add_operator(
        OpKind::MaxPool(PoolAttrs {
            kernel: [2, 2],
            strides: [2, 2],
            pads: [0; 4],
            count_include_pad: false,
        }),
        vec![relu],
        vec![pool],
    );
    g.add_operator(OpKind::Flatten { axis: 1 }, vec![pool], vec![flat]);
    g.mark_output(flat);
    g
}

fn sum_graph() -> ComputeGraph {
    let mut g = ComputeGraph::new("sum");
    let x = g.add_tensor("data", vec![1, 2], DType::F32, TensorKind::Input, None);
    g.mark_input(x);
    let r = g.add_tensor("r", vec![1, 2], DType::F32, TensorKind::Value, None);
    let s = g.add_tensor("s", vec![1, 2], DType::F32, TensorKind::Value, None);
    g.add_operator(OpKind::Relu, vec![x], vec![r]);
    g.add_operator(OpKind::Sum, vec![x, r], vec![s]);
    g.mark_output(s);
    g
}

#[test]
fn test_bm1880_selects_in_order_and_drops_unsupported() {
    let g = network();
    let table = CalibrationTable::dummy(&g);
    let sel = create_lowering(March::Bm1880).select(&g, Some(&table)).unwrap();

    let kinds: Vec<&str> = sel.instructions.iter().map(|i| i.type_name()).collect();
    assert_eq!(kinds, vec!["conv", "relu", "maxpool"]);
    assert_eq!(sel.diagnostics.len(), 1);
    assert_eq!(sel.diagnostics[0].subject.as_deref(), Some("flat"));
    assert!(sel.diagnostics[0].message.contains("Flatten"));

    let conv = &sel.instructions[0];
    assert_eq!(conv.layer_name, "conv");
    assert_eq!(conv.inputs.len(), 3);
    let q = conv.quant.as_ref().unwrap();
    assert_eq!(q.threshold_x, vec![1.0]);
    assert_eq!(q.right_shift, Some(0));
    assert_eq!(q.multiplier, None);

    let pool = sel.instructions[2].quant.as_ref().unwrap();
    assert_eq!(pool.right_shift, Some(0));
    assert_eq!(pool.multiplier, Some(1));
    assert!(sel.instructions[1].quant.as_ref().unwrap().right_shift.is_none());
}

#[test]
fn test_bm1880_missing_record_is_fatal() {
    let g = network();
    let mut table = CalibrationTable::dummy(&g);
    table.layers.retain(|l| l.name != "conv");
    let err = Bm1880Lowering.select(&g, Some(&table)).unwrap_err();
    assert_eq!(
        err,
        SelectError::MissingCalibration {
            layer: "conv".into(),
            kind: "Conv".into()
        }
    );
}

#[test]
fn test_bm1880_requires_scale_fields() {
    let g = network();
    let mut table = CalibrationTable::dummy(&g);
    if let Some(pool) = table.layers.iter_mut().find(|l| l.name == "pool") {
        pool.blobs[0].multiplier = None;
    }
    let err = Bm1880Lowering.select(&g, Some(&table)).unwrap_err();
    assert_eq!(
        err,
        SelectError::MissingField {
            layer: "pool".into(),
            field: "multiplier"
        }
    );
}

#[test]
fn test_bm1880_requires_table() {
    let err = Bm1880Lowering.select(&network(), None).unwrap_err();
    assert!(matches!(err, SelectError::NoTable { .. }));
}

#[test]
fn test_bm1880_sum_carries_input_ratios() {
    let g = sum_graph();
    let table = CalibrationTable::dummy(&g);
    let sel = Bm1880Lowering.select(&g, Some(&table)).unwrap();
    let sum = &sel.instructions[1];
    assert_eq!(sum.type_name(), "eltwise_sum");
    let q = sum.quant.as_ref().unwrap();
    assert_eq!(q.threshold_x, vec![1.0, 1.0]);
    assert_eq!(q.threshold_x_quantized, vec![1, 1]);
    assert_eq!(q.right_shift, Some(0));
}

#[test]
fn test_bm1680_runs_without_calibration() {
    let g = network();
    let sel = create_lowering(March::Bm1680).select(&g, None).unwrap();
    assert_eq!(sel.instructions.len(), 3);
    assert!(sel.instructions.iter().all(|i| i.quant.is_none()));
    assert_eq!(sel.diagnostics.len(), 1);
}

#[test]
fn test_listing_has_one_line_per_instruction() {
    let g = network();
    let table = CalibrationTable::dummy(&g);
    let sel = Bm1880Lowering.select(&g, Some(&table)).unwrap();
    let listing = sel.listing();
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("conv"));
    assert!(lines[0].contains("(data, w, b) -> (conv)"));
    assert!(lines[0].contains("rshift=0"));
    assert!(lines[2].contains("mul=1"));
}
