//! Matchers for the network-layer operators: convolution, fully-connected,
//! per-channel scale, pooling, LRN and softmax.

use super::{Arity, LowerError, NodeKind, StandardLower};
use crate::ir::builder::IrBuilder;
use crate::ir::{ConvAttrs, GemmAttrs, LrnAttrs, OpKind, PoolAttrs};
use crate::onnx::Node;

pub(super) fn lowerings() -> Vec<StandardLower> {
    vec![
        StandardLower::new(NodeKind::Conv, Arity::between(2, 3), Arity::exactly(1), conv)
            .accepting(is_2d),
        StandardLower::new(NodeKind::Gemm, Arity::between(2, 3), Arity::exactly(1), gemm),
        StandardLower::new(NodeKind::Scale, Arity::between(2, 3), Arity::exactly(1), scale),
        StandardLower::new(
            NodeKind::MaxPool,
            Arity::exactly(1),
            Arity::between(1, 2),
            max_pool,
        )
        .accepting(is_2d),
        StandardLower::new(
            NodeKind::AveragePool,
            Arity::exactly(1),
            Arity::exactly(1),
            average_pool,
        )
        .accepting(is_2d),
        StandardLower::new(NodeKind::Lrn, Arity::exactly(1), Arity::exactly(1), lrn),
        StandardLower::new(NodeKind::Softmax, Arity::exactly(1), Arity::exactly(1), softmax),
    ]
}

/// Only 2-D windows are claimed; a declared kernel of another rank is not ours.
fn is_2d(node: &Node) -> bool {
    node.attr_ints("kernel_shape")
        .map_or(true, |k| k.len() == 2)
}

// ─── Attribute helpers ────────────────────────────────────────────

fn positive(node: &Node, key: &str, v: i64) -> Result<usize, LowerError> {
    if v <= 0 {
        return Err(LowerError::invalid(node, key, format!("{} is not positive", v)));
    }
    Ok(v as usize)
}

fn pair(node: &Node, key: &str, default: usize) -> Result<[usize; 2], LowerError> {
    match node.attr_ints(key) {
        None => Ok([default, default]),
        Some([a, b]) => Ok([positive(node, key, *a)?, positive(node, key, *b)?]),
        Some(other) => Err(LowerError::invalid(
            node,
            key,
            format!("expected 2 values, found {}", other.len()),
        )),
    }
}

fn pads(node: &Node) -> Result<[usize; 4], LowerError> {
    match node.attr_ints("pads") {
        None => Ok([0; 4]),
        Some(p) if p.len() == 4 => {
            let mut out = [0usize; 4];
            for (slot, &v) in out.iter_mut().zip(p) {
                if v < 0 {
                    return Err(LowerError::invalid(node, "pads", "negative padding"));
                }
                *slot = v as usize;
            }
            Ok(out)
        }
        Some(p) => Err(LowerError::invalid(
            node,
            "pads",
            format!("expected 4 values, found {}", p.len()),
        )),
    }
}

/// Resolve `auto_pad` into explicit `[top, left, bottom, right]` padding.
fn auto_pads(
    builder: &IrBuilder<'_>,
    node: &Node,
    kernel: [usize; 2],
    strides: [usize; 2],
    dilations: [usize; 2],
) -> Result<[usize; 4], LowerError> {
    let mode = node.attr_s("auto_pad").unwrap_or("NOTSET");
    match mode {
        "NOTSET" => pads(node),
        "VALID" => Ok([0; 4]),
        "SAME_UPPER" | "SAME_LOWER" => {
            let shape = node
                .inputs
                .first()
                .and_then(|n| builder.lookup(n))
                .map(|t| t.shape.clone())
                .unwrap_or_default();
            if shape.len() != 4 {
                return Err(LowerError::invalid(
                    node,
                    "auto_pad",
                    "input shape unknown, cannot derive padding",
                ));
            }
            let mut begin = [0usize; 2];
            let mut end = [0usize; 2];
            for axis in 0..2 {
                let size = shape[axis + 2];
                let out = size.div_ceil(strides[axis]);
                let span = (kernel[axis] - 1) * dilations[axis] + 1;
                let total = (out.saturating_sub(1) * strides[axis] + span).saturating_sub(size);
                let small = total / 2;
                let large = total - small;
                if mode == "SAME_UPPER" {
                    begin[axis] = small;
                    end[axis] = large;
                } else {
                    begin[axis] = large;
                    end[axis] = small;
                }
            }
            Ok([begin[0], begin[1], end[0], end[1]])
        }
        other => Err(LowerError::invalid(
            node,
            "auto_pad",
            format!("unknown mode '{}'", other),
        )),
    }
}

fn axis(node: &Node, default: i64) -> i64 {
    node.attr_i("axis").unwrap_or(default)
}

// ─── Parsers ──────────────────────────────────────────────────────

fn conv(builder: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    let kernel = match node.attr_ints("kernel_shape") {
        Some(_) => pair(node, "kernel_shape", 1)?,
        None => {
            let weight = node.inputs.get(1).and_then(|w| builder.lookup(w));
            match weight.map(|w| w.shape.as_slice()) {
                Some([_, _, kh, kw]) => [
                    positive(node, "kernel_shape", *kh as i64)?,
                    positive(node, "kernel_shape", *kw as i64)?,
                ],
                _ => return Err(LowerError::missing(node, "kernel_shape")),
            }
        }
    };
    let strides = pair(node, "strides", 1)?;
    let dilations = pair(node, "dilations", 1)?;
    let pads = auto_pads(builder, node, kernel, strides, dilations)?;
    let group = positive(node, "group", node.attr_i("group").unwrap_or(1))?;
    Ok(OpKind::Conv(ConvAttrs {
        kernel,
        strides,
        pads,
        dilations,
        group,
    }))
}

fn gemm(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Gemm(GemmAttrs {
        alpha: node.attr_f("alpha").unwrap_or(1.0),
        beta: node.attr_f("beta").unwrap_or(1.0),
        trans_a: node.attr_i("transA").unwrap_or(0) != 0,
        trans_b: node.attr_i("transB").unwrap_or(0) != 0,
    }))
}

fn scale(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Scale {
        axis: axis(node, 1),
    })
}

fn pool(builder: &IrBuilder<'_>, node: &Node) -> Result<PoolAttrs, LowerError> {
    if !node.has_attr("kernel_shape") {
        return Err(LowerError::missing(node, "kernel_shape"));
    }
    let kernel = pair(node, "kernel_shape", 1)?;
    let strides = pair(node, "strides", 1)?;
    let pads = auto_pads(builder, node, kernel, strides, [1, 1])?;
    Ok(PoolAttrs {
        kernel,
        strides,
        pads,
        count_include_pad: node.attr_i("count_include_pad").unwrap_or(0) != 0,
    })
}

fn max_pool(builder: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    pool(builder, node).map(OpKind::MaxPool)
}

fn average_pool(builder: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    pool(builder, node).map(OpKind::AveragePool)
}

fn lrn(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    let size = node
        .attr_i("size")
        .ok_or_else(|| LowerError::missing(node, "size"))?;
    Ok(OpKind::Lrn(LrnAttrs {
        size: positive(node, "size", size)?,
        alpha: node.attr_f("alpha").unwrap_or(1e-4),
        beta: node.attr_f("beta").unwrap_or(0.75),
        bias: node.attr_f("bias").unwrap_or(1.0),
    }))
}

fn softmax(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Softmax {
        axis: axis(node, 1),
    })
}
