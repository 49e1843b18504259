//! Operator kinds of the compute IR and their typed parameters.

use std::fmt;

/// 2-D convolution parameters. Pads are `[top, left, bottom, right]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvAttrs {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
    pub group: usize,
}

impl Default for ConvAttrs {
    fn default() -> Self {
        Self {
            kernel: [1, 1],
            strides: [1, 1],
            pads: [0; 4],
            dilations: [1, 1],
            group: 1,
        }
    }
}

/// 2-D pooling window parameters. Pads are `[top, left, bottom, right]`.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolAttrs {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 4],
    pub count_include_pad: bool,
}

impl PoolAttrs {
    /// Number of elements in one window.
    pub fn area(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }
}

/// General matrix multiply: `alpha * A' * B' + beta * C`.
#[derive(Clone, Debug, PartialEq)]
pub struct GemmAttrs {
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: bool,
    pub trans_b: bool,
}

impl Default for GemmAttrs {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            trans_a: false,
            trans_b: false,
        }
    }
}

/// Local response normalisation across channels.
#[derive(Clone, Debug, PartialEq)]
pub struct LrnAttrs {
    pub size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub bias: f32,
}

/// Random tensor generator. `seed` is kept for fidelity; generation
/// itself is not part of the compiled stream.
#[derive(Clone, Debug, PartialEq)]
pub struct RandomNormalAttrs {
    pub shape: Vec<i64>,
    pub dtype: i64,
    pub mean: f32,
    pub scale: f32,
    pub seed: Option<f32>,
}

/// Calibration treatment of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerClass {
    /// Carries weights (conv, fully-connected, per-channel scale).
    Weighted,
    /// Windowed reduction over one input.
    Pool,
    /// Element-wise combination of several inputs.
    Eltwise,
    /// Output range equals input range.
    PassThrough,
    /// Fan-in merge whose inputs can share the output threshold.
    Merge,
    /// Threshold recorded, no scale parameters.
    Passive,
    /// No calibration policy.
    Unclassified,
}

/// A compute operator kind with its typed parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    Conv(ConvAttrs),
    Gemm(GemmAttrs),
    /// Per-channel affine `y = x * w[c] (+ b[c])` along `axis`.
    Scale { axis: i64 },
    MaxPool(PoolAttrs),
    AveragePool(PoolAttrs),
    Sum,
    Max,
    Mul,
    Relu,
    Flatten { axis: i64 },
    Reshape { shape: Vec<i64> },
    Dropout { ratio: f32 },
    Concat { axis: i64 },
    Softmax { axis: i64 },
    Lrn(LrnAttrs),
    RandomNormal(RandomNormalAttrs),
    ReduceProd { axes: Vec<i64>, keepdims: bool },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Conv(_) => "Conv",
            OpKind::Gemm(_) => "Gemm",
            OpKind::Scale { .. } => "Scale",
            OpKind::MaxPool(_) => "MaxPool",
            OpKind::AveragePool(_) => "AveragePool",
            OpKind::Sum => "Sum",
            OpKind::Max => "Max",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::Flatten { .. } => "Flatten",
            OpKind::Reshape { .. } => "Reshape",
            OpKind::Dropout { .. } => "Dropout",
            OpKind::Concat { .. } => "Concat",
            OpKind::Softmax { .. } => "Softmax",
            OpKind::Lrn(_) => "LRN",
            OpKind::RandomNormal(_) => "RandomNormal",
            OpKind::ReduceProd { .. } => "ReduceProd",
        }
    }

    pub fn class(&self) -> LayerClass {
        match self {
            OpKind::Conv(_) | OpKind::Gemm(_) | OpKind::Scale { .. } => LayerClass::Weighted,
            OpKind::MaxPool(_) | OpKind::AveragePool(_) => LayerClass::Pool,
            OpKind::Sum | OpKind::Max | OpKind::Mul => LayerClass::Eltwise,
            OpKind::Relu
            | OpKind::Flatten { .. }
            | OpKind::Reshape { .. }
            | OpKind::Dropout { .. } => LayerClass::PassThrough,
            OpKind::Concat { .. } => LayerClass::Merge,
            OpKind::Softmax { .. } | OpKind::Lrn(_) => LayerClass::Passive,
            OpKind::RandomNormal(_) | OpKind::ReduceProd { .. } => LayerClass::Unclassified,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.class() == LayerClass::PassThrough
    }

    pub fn is_merge(&self) -> bool {
        self.class() == LayerClass::Merge
    }
}

fn pair(v: &[usize; 2]) -> String {
    format!("{}x{}", v[0], v[1])
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Conv(a) => write!(
                f,
                "Conv[k={} s={} p={:?} d={} g={}]",
                pair(&a.kernel),
                pair(&a.strides),
                a.pads,
                pair(&a.dilations),
                a.group
            ),
            OpKind::MaxPool(a) | OpKind::AveragePool(a) => write!(
                f,
                "{}[k={} s={} p={:?}]",
                self.name(),
                pair(&a.kernel),
                pair(&a.strides),
                a.pads
            ),
            OpKind::Gemm(a) => write!(
                f,
                "Gemm[alpha={} beta={} tA={} tB={}]",
                a.alpha, a.beta, a.trans_a as u8, a.trans_b as u8
            ),
            OpKind::Scale { axis }
            | OpKind::Flatten { axis }
            | OpKind::Concat { axis }
            | OpKind::Softmax { axis } => write!(f, "{}[axis={}]", self.name(), axis),
            OpKind::Reshape { shape } => write!(f, "Reshape[{:?}]", shape),
            OpKind::Lrn(a) => write!(
                f,
                "LRN[size={} alpha={} beta={} bias={}]",
                a.size, a.alpha, a.beta, a.bias
            ),
            OpKind::ReduceProd { axes, keepdims } => {
                write!(f, "ReduceProd[axes={:?} keepdims={}]", axes, *keepdims as u8)
            }
            _ => f.write_str(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(OpKind::Conv(ConvAttrs::default()).class(), LayerClass::Weighted);
        assert!(OpKind::Relu.is_pass_through());
        assert!(OpKind::Dropout { ratio: 0.5 }.is_pass_through());
        assert!(OpKind::Concat { axis: 1 }.is_merge());
        assert!(!OpKind::Sum.is_merge());
        assert_eq!(OpKind::Softmax { axis: 1 }.class(), LayerClass::Passive);
    }

    #[test]
    fn test_display() {
        let conv = OpKind::Conv(ConvAttrs {
            kernel: [3, 3],
            pads: [1, 1, 1, 1],
            ..ConvAttrs::default()
        });
        assert_eq!(conv.to_string(), "Conv[k=3x3 s=1x1 p=[1, 1, 1, 1] d=1x1 g=1]");
        assert_eq!(OpKind::Concat { axis: 1 }.to_string(), "Concat[axis=1]");
        assert_eq!(OpKind::Relu.to_string(), "Relu");
    }
}
