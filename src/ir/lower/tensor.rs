//! Matchers for shape, element-wise and generator operators.

use super::{Arity, LowerError, NodeKind, StandardLower};
use crate::ir::builder::IrBuilder;
use crate::ir::{OpKind, RandomNormalAttrs, TensorData};
use crate::onnx::Node;

pub(super) fn lowerings() -> Vec<StandardLower> {
    vec![
        StandardLower::new(NodeKind::Relu, Arity::exactly(1), Arity::exactly(1), relu),
        StandardLower::new(NodeKind::Flatten, Arity::exactly(1), Arity::exactly(1), flatten),
        StandardLower::new(NodeKind::Reshape, Arity::between(1, 2), Arity::exactly(1), reshape),
        StandardLower::new(
            NodeKind::Dropout,
            Arity::between(1, 3),
            Arity::between(1, 2),
            dropout,
        ),
        StandardLower::new(NodeKind::Concat, Arity::at_least(1), Arity::exactly(1), concat),
        StandardLower::new(NodeKind::Sum, Arity::at_least(1), Arity::exactly(1), sum),
        StandardLower::new(NodeKind::Max, Arity::at_least(1), Arity::exactly(1), max),
        StandardLower::new(NodeKind::Mul, Arity::exactly(2), Arity::exactly(1), mul),
        StandardLower::new(
            NodeKind::RandomNormal,
            Arity::exactly(0),
            Arity::exactly(1),
            random_normal,
        ),
        StandardLower::new(
            NodeKind::ReduceProd,
            Arity::exactly(1),
            Arity::exactly(1),
            reduce_prod,
        ),
    ]
}

fn relu(_: &IrBuilder<'_>, _: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Relu)
}

fn flatten(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Flatten {
        axis: node.attr_i("axis").unwrap_or(1),
    })
}

/// Target shape comes from the second input when it is a constant,
/// otherwise from the legacy `shape` attribute.
fn reshape(builder: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    if let Some(name) = node.inputs.get(1).filter(|n| !n.is_empty()) {
        return match builder.lookup(name).and_then(|t| t.data.as_ref()) {
            Some(TensorData::I64(shape)) => Ok(OpKind::Reshape {
                shape: shape.clone(),
            }),
            _ => Err(LowerError::invalid(
                node,
                "shape",
                format!("'{}' is not a constant int64 tensor", name),
            )),
        };
    }
    match node.attr_ints("shape") {
        Some(shape) => Ok(OpKind::Reshape {
            shape: shape.to_vec(),
        }),
        None => Err(LowerError::missing(node, "shape")),
    }
}

fn dropout(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    let ratio = node.attr_f("ratio").unwrap_or(0.5);
    if !(0.0..1.0).contains(&ratio) {
        return Err(LowerError::invalid(
            node,
            "ratio",
            format!("{} is outside [0, 1)", ratio),
        ));
    }
    Ok(OpKind::Dropout { ratio })
}

fn concat(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    let axis = node
        .attr_i("axis")
        .ok_or_else(|| LowerError::missing(node, "axis"))?;
    Ok(OpKind::Concat { axis })
}

fn sum(_: &IrBuilder<'_>, _: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Sum)
}

fn max(_: &IrBuilder<'_>, _: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Max)
}

fn mul(_: &IrBuilder<'_>, _: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::Mul)
}

fn random_normal(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    let shape = node
        .attr_ints("shape")
        .ok_or_else(|| LowerError::missing(node, "shape"))?;
    Ok(OpKind::RandomNormal(RandomNormalAttrs {
        shape: shape.to_vec(),
        dtype: node.attr_i("dtype").unwrap_or(1),
        mean: node.attr_f("mean").unwrap_or(0.0),
        scale: node.attr_f("scale").unwrap_or(1.0),
        seed: node.attr_f("seed"),
    }))
}

fn reduce_prod(_: &IrBuilder<'_>, node: &Node) -> Result<OpKind, LowerError> {
    Ok(OpKind::ReduceProd {
        axes: node.attr_ints("axes").map(<[i64]>::to_vec).unwrap_or_default(),
        keepdims: node.attr_i("keepdims").unwrap_or(1) != 0,
    })
}
