//! Execution oracle: produces ground-truth floating activations for one
//! operator at a time.
//!
//! `ExecutionOracle` is the seam; `ReferenceOracle` is a small f32 NCHW
//! interpreter covering the operators the lowering framework produces.

use crate::ir::{ComputeGraph, ComputeOperator, OpId, OpKind, PoolAttrs};

use super::error::OracleError;

/// A dense f32 tensor value in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct Activation {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Activation {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Runs exactly one operator on already materialised inputs.
pub trait ExecutionOracle {
    /// `inputs` follows the operator's input order, constants included.
    /// Returns one activation per produced output, in output order.
    fn execute(
        &self,
        graph: &ComputeGraph,
        op: OpId,
        inputs: &[&Activation],
    ) -> Result<Vec<Activation>, OracleError>;
}

/// Straightforward f32 interpreter.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceOracle;

impl ExecutionOracle for ReferenceOracle {
    fn execute(
        &self,
        graph: &ComputeGraph,
        op: OpId,
        inputs: &[&Activation],
    ) -> Result<Vec<Activation>, OracleError> {
        let operator = graph.op(op);
        let ctx = Ctx {
            layer: graph.layer_name(op),
            op: operator,
            inputs,
        };
        let out = match &operator.kind {
            OpKind::Conv(a) => ctx.conv(a)?,
            OpKind::Gemm(a) => ctx.gemm(a.alpha, a.beta, a.trans_a, a.trans_b)?,
            OpKind::Scale { axis } => ctx.scale(*axis)?,
            OpKind::MaxPool(a) => ctx.pool(a, true)?,
            OpKind::AveragePool(a) => ctx.pool(a, false)?,
            OpKind::Relu => {
                let x = ctx.arg(0)?;
                Activation::new(x.shape.clone(), x.data.iter().map(|v| v.max(0.0)).collect())
            }
            OpKind::Dropout { .. } => ctx.arg(0)?.clone(),
            OpKind::Flatten { axis } => {
                let x = ctx.arg(0)?;
                let rank = x.shape.len();
                let axis = if *axis as usize == rank && *axis >= 0 {
                    rank
                } else {
                    ctx.axis(*axis, rank)?
                };
                let outer: usize = x.shape[..axis].iter().product();
                let inner: usize = x.shape[axis..].iter().product();
                Activation::new(vec![outer, inner], x.data.clone())
            }
            OpKind::Reshape { shape } => ctx.reshape(shape)?,
            OpKind::Concat { axis } => ctx.concat(*axis)?,
            OpKind::Sum => ctx.eltwise(|a, b| a + b)?,
            OpKind::Max => ctx.eltwise(f32::max)?,
            OpKind::Mul => ctx.eltwise(|a, b| a * b)?,
            OpKind::Softmax { axis } => ctx.softmax(*axis)?,
            OpKind::Lrn(a) => ctx.lrn(a.size, a.alpha, a.beta, a.bias)?,
            OpKind::ReduceProd { axes, keepdims } => ctx.reduce_prod(axes, *keepdims)?,
            OpKind::RandomNormal(_) => {
                return Err(OracleError::Unsupported {
                    layer: ctx.layer.to_string(),
                    kind: operator.kind.name().to_string(),
                })
            }
        };
        Ok(vec![out])
    }
}

struct Ctx<'a> {
    layer: &'a str,
    op: &'a ComputeOperator,
    inputs: &'a [&'a Activation],
}

impl Ctx<'_> {
    fn arg(&self, idx: usize) -> Result<&Activation, OracleError> {
        self.inputs
            .get(idx)
            .copied()
            .ok_or_else(|| OracleError::MissingInput {
                layer: self.layer.to_string(),
                tensor: format!("input #{}", idx),
            })
    }

    fn shape_err(&self, reason: impl Into<String>) -> OracleError {
        OracleError::Shape {
            layer: self.layer.to_string(),
            reason: reason.into(),
        }
    }

    fn axis(&self, axis: i64, rank: usize) -> Result<usize, OracleError> {
        let resolved = if axis < 0 { axis + rank as i64 } else { axis };
        if resolved < 0 || resolved as usize >= rank.max(1) {
            return Err(self.shape_err(format!("axis {} out of range for rank {}", axis, rank)));
        }
        Ok(resolved as usize)
    }

    fn nchw(&self, x: &Activation) -> Result<[usize; 4], OracleError> {
        match x.shape.as_slice() {
            &[n, c, h, w] => Ok([n, c, h, w]),
            other => Err(self.shape_err(format!("expected NCHW input, found {:?}", other))),
        }
    }

    fn conv(&self, a: &crate::ir::ConvAttrs) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let wt = self.arg(1)?;
        let bias = if self.op.inputs.len() > 2 {
            Some(self.arg(2)?)
        } else {
            None
        };
        let [n, c, h, w] = self.nchw(x)?;
        let m = wt.shape.first().copied().unwrap_or(0);
        let cg = c / a.group;
        let mg = m / a.group.max(1);
        let [kh, kw] = a.kernel;
        if wt.len() != m * cg * kh * kw || m % a.group != 0 {
            return Err(self.shape_err(format!(
                "weight {:?} does not fit {} input channels in {} groups",
                wt.shape, c, a.group
            )));
        }
        let span_h = (kh - 1) * a.dilations[0] + 1;
        let span_w = (kw - 1) * a.dilations[1] + 1;
        let (padded_h, padded_w) = (h + a.pads[0] + a.pads[2], w + a.pads[1] + a.pads[3]);
        if padded_h < span_h || padded_w < span_w {
            return Err(self.shape_err("kernel larger than padded input"));
        }
        let oh = (padded_h - span_h) / a.strides[0] + 1;
        let ow = (padded_w - span_w) / a.strides[1] + 1;

        let mut out = vec![0.0f32; n * m * oh * ow];
        for b in 0..n {
            for oc in 0..m {
                let g = oc / mg;
                let base = bias.map_or(0.0, |bv| bv.data.get(oc).copied().unwrap_or(0.0));
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = base;
                        for ic in 0..cg {
                            let ch = g * cg + ic;
                            for ky in 0..kh {
                                let iy = (oy * a.strides[0] + ky * a.dilations[0]) as isize
                                    - a.pads[0] as isize;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let ix = (ox * a.strides[1] + kx * a.dilations[1]) as isize
                                        - a.pads[1] as isize;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    let xi = ((b * c + ch) * h + iy as usize) * w + ix as usize;
                                    let wi = ((oc * cg + ic) * kh + ky) * kw + kx;
                                    acc += x.data[xi] * wt.data[wi];
                                }
                            }
                        }
                        out[((b * m + oc) * oh + oy) * ow + ox] = acc;
                    }
                }
            }
        }
        Ok(Activation::new(vec![n, m, oh, ow], out))
    }

    fn gemm(
        &self,
        alpha: f32,
        beta: f32,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Activation, OracleError> {
        let a = self.arg(0)?;
        let b = self.arg(1)?;
        let rows = a.shape.first().copied().unwrap_or(1);
        let cols = a.len() / rows.max(1);
        let (m, k) = if trans_a { (cols, rows) } else { (rows, cols) };
        let (kb, nn) = match b.shape.as_slice() {
            &[r, c] if trans_b => (c, r),
            &[r, c] => (r, c),
            other => return Err(self.shape_err(format!("Gemm B must be 2-D, found {:?}", other))),
        };
        if k != kb {
            return Err(self.shape_err(format!("inner dimensions differ: {} vs {}", k, kb)));
        }
        let c = if self.op.inputs.len() > 2 {
            Some(self.arg(2)?)
        } else {
            None
        };

        let mut out = vec![0.0f32; m * nn];
        for i in 0..m {
            for j in 0..nn {
                let mut acc = 0.0f32;
                for p in 0..k {
                    let av = if trans_a { a.data[p * m + i] } else { a.data[i * k + p] };
                    let bv = if trans_b { b.data[j * k + p] } else { b.data[p * nn + j] };
                    acc += av * bv;
                }
                let cv = match c {
                    Some(cv) if cv.len() == m * nn => cv.data[i * nn + j],
                    Some(cv) if cv.len() == nn => cv.data[j],
                    Some(cv) if cv.len() == 1 => cv.data[0],
                    Some(cv) if cv.len() == m => cv.data[i],
                    Some(_) => return Err(self.shape_err("Gemm C does not broadcast")),
                    None => 0.0,
                };
                out[i * nn + j] = alpha * acc + beta * cv;
            }
        }
        Ok(Activation::new(vec![m, nn], out))
    }

    fn scale(&self, axis: i64) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let s = self.arg(1)?;
        let bias = if self.op.inputs.len() > 2 {
            Some(self.arg(2)?)
        } else {
            None
        };
        let axis = self.axis(axis, x.shape.len())?;
        let channels = x.shape[axis];
        let inner: usize = x.shape[axis + 1..].iter().product();
        if s.len() != channels {
            return Err(self.shape_err(format!(
                "scale has {} values for {} channels",
                s.len(),
                channels
            )));
        }
        let data = x
            .data
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let ch = (i / inner.max(1)) % channels;
                let b = bias.map_or(0.0, |b| b.data.get(ch).copied().unwrap_or(0.0));
                v * s.data[ch] + b
            })
            .collect();
        Ok(Activation::new(x.shape.clone(), data))
    }

    fn pool(&self, a: &PoolAttrs, max: bool) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let [n, c, h, w] = self.nchw(x)?;
        let [kh, kw] = a.kernel;
        let (padded_h, padded_w) = (h + a.pads[0] + a.pads[2], w + a.pads[1] + a.pads[3]);
        if padded_h < kh || padded_w < kw {
            return Err(self.shape_err("window larger than padded input"));
        }
        let oh = (padded_h - kh) / a.strides[0] + 1;
        let ow = (padded_w - kw) / a.strides[1] + 1;
        let mut out = Vec::with_capacity(n * c * oh * ow);
        for plane in 0..n * c {
            let src = &x.data[plane * h * w..(plane + 1) * h * w];
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for ky in 0..kh {
                        let iy = (oy * a.strides[0] + ky) as isize - a.pads[0] as isize;
                        for kx in 0..kw {
                            let ix = (ox * a.strides[1] + kx) as isize - a.pads[1] as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            let v = src[iy as usize * w + ix as usize];
                            best = best.max(v);
                            sum += v;
                            count += 1;
                        }
                    }
                    let v = if max {
                        best
                    } else {
                        let div = if a.count_include_pad { a.area() } else { count };
                        sum / div.max(1) as f32
                    };
                    out.push(v);
                }
            }
        }
        Ok(Activation::new(vec![n, c, oh, ow], out))
    }

    fn reshape(&self, target: &[i64]) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let mut shape = Vec::with_capacity(target.len());
        let mut infer = None;
        for (i, &d) in target.iter().enumerate() {
            match d {
                0 => shape.push(x.shape.get(i).copied().unwrap_or(1)),
                -1 if infer.is_none() => {
                    infer = Some(i);
                    shape.push(1);
                }
                d if d > 0 => shape.push(d as usize),
                _ => return Err(self.shape_err(format!("invalid target shape {:?}", target))),
            }
        }
        let known: usize = shape.iter().product();
        if let Some(i) = infer {
            if known == 0 || x.len() % known != 0 {
                return Err(self.shape_err(format!("cannot infer -1 in {:?}", target)));
            }
            shape[i] = x.len() / known;
        }
        if shape.iter().product::<usize>() != x.len() {
            return Err(self.shape_err(format!(
                "cannot reshape {:?} into {:?}",
                x.shape, target
            )));
        }
        Ok(Activation::new(shape, x.data.clone()))
    }

    fn concat(&self, axis: i64) -> Result<Activation, OracleError> {
        let first = self.arg(0)?;
        let axis = self.axis(axis, first.shape.len())?;
        let outer: usize = first.shape[..axis].iter().product();
        let mut shape = first.shape.clone();
        shape[axis] = 0;
        for x in self.inputs {
            if x.shape.len() != first.shape.len() {
                return Err(self.shape_err("concat inputs differ in rank"));
            }
            shape[axis] += x.shape[axis];
        }
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for x in self.inputs {
                let chunk = x.len() / outer.max(1);
                data.extend_from_slice(&x.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Activation::new(shape, data))
    }

    fn eltwise(&self, f: impl Fn(f32, f32) -> f32) -> Result<Activation, OracleError> {
        let first = self.arg(0)?;
        let mut acc = first.clone();
        for x in &self.inputs[1..] {
            if x.len() == acc.len() {
                for (a, b) in acc.data.iter_mut().zip(&x.data) {
                    *a = f(*a, *b);
                }
            } else if x.len() == 1 {
                for a in acc.data.iter_mut() {
                    *a = f(*a, x.data[0]);
                }
            } else if acc.len() == 1 {
                let s = acc.data[0];
                acc = Activation::new(x.shape.clone(), x.data.iter().map(|b| f(s, *b)).collect());
            } else {
                return Err(self.shape_err(format!(
                    "cannot combine {:?} with {:?}",
                    acc.shape, x.shape
                )));
            }
        }
        Ok(acc)
    }

    fn softmax(&self, axis: i64) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let axis = self.axis(axis, x.shape.len())?;
        let inner: usize = x.shape[axis..].iter().product();
        let mut data = x.data.clone();
        for row in data.chunks_mut(inner.max(1)) {
            let peak = row.iter().fold(f32::NEG_INFINITY, |m, v| m.max(*v));
            let mut total = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - peak).exp();
                total += *v;
            }
            for v in row.iter_mut() {
                *v /= total;
            }
        }
        Ok(Activation::new(x.shape.clone(), data))
    }

    fn lrn(&self, size: usize, alpha: f32, beta: f32, bias: f32) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let [n, c, h, w] = self.nchw(x)?;
        let plane = h * w;
        let lo = (size - 1) / 2;
        let hi = size / 2;
        let mut data = vec![0.0f32; x.len()];
        for b in 0..n {
            for ch in 0..c {
                let first = ch.saturating_sub(lo);
                let last = (ch + hi).min(c - 1);
                for p in 0..plane {
                    let mut sq = 0.0f32;
                    for k in first..=last {
                        let v = x.data[(b * c + k) * plane + p];
                        sq += v * v;
                    }
                    let idx = (b * c + ch) * plane + p;
                    data[idx] = x.data[idx] / (bias + alpha / size as f32 * sq).powf(beta);
                }
            }
        }
        Ok(Activation::new(x.shape.clone(), data))
    }

    fn reduce_prod(&self, axes: &[i64], keepdims: bool) -> Result<Activation, OracleError> {
        let x = self.arg(0)?;
        let rank = x.shape.len();
        let mut reduced = vec![axes.is_empty(); rank];
        for &a in axes {
            reduced[self.axis(a, rank)?] = true;
        }
        let kept: Vec<usize> = x
            .shape
            .iter()
            .zip(&reduced)
            .map(|(&d, &r)| if r { 1 } else { d })
            .collect();
        let mut out = vec![1.0f32; kept.iter().product()];
        for (flat, v) in x.data.iter().enumerate() {
            let mut rem = flat;
            let mut target = 0usize;
            let mut stride = 1usize;
            for d in (0..rank).rev() {
                let coord = rem % x.shape[d];
                rem /= x.shape[d];
                if !reduced[d] {
                    target += coord * stride;
                }
                stride *= kept[d];
            }
            out[target] *= v;
        }
        let shape = if keepdims {
            kept
        } else {
            x.shape
                .iter()
                .zip(&reduced)
                .filter(|&(_, &r)| !r)
                .map(|(&d, _)| d)
                .collect()
        };
        Ok(Activation::new(shape, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConvAttrs, DType, TensorKind};

    fn single_op(kind: OpKind, arity: usize) -> ComputeGraph {
        let mut g = ComputeGraph::new("t");
        let ins: Vec<_> = (0..arity)
            .map(|i| g.add_tensor(format!("in{}", i), vec![], DType::F32, TensorKind::Input, None))
            .collect();
        let out = g.add_tensor("out", vec![], DType::F32, TensorKind::Value, None);
        g.add_operator(kind, ins, vec![out]);
        g
    }

    fn run(kind: OpKind, inputs: &[Activation]) -> Activation {
        let g = single_op(kind, inputs.len());
        let refs: Vec<&Activation> = inputs.iter().collect();
        ReferenceOracle
            .execute(&g, OpId(0), &refs)
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_conv_with_padding_and_bias() {
        let x = Activation::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = Activation::new(vec![1, 1, 3, 3], vec![1.0; 9]);
        let b = Activation::new(vec![1], vec![0.5]);
        let conv = OpKind::Conv(ConvAttrs {
            kernel: [3, 3],
            pads: [1, 1, 1, 1],
            ..ConvAttrs::default()
        });
        let y = run(conv, &[x, w, b]);
        assert_eq!(y.shape, vec![1, 1, 2, 2]);
        assert_eq!(y.data, vec![10.5; 4]);
    }

    #[test]
    fn test_max_and_average_pool() {
        let x = Activation::new(vec![1, 1, 2, 2], vec![1.0, -2.0, 3.0, 6.0]);
        let attrs = PoolAttrs {
            kernel: [2, 2],
            strides: [2, 2],
            pads: [0; 4],
            count_include_pad: false,
        };
        assert_eq!(run(OpKind::MaxPool(attrs.clone()), &[x.clone()]).data, vec![6.0]);
        assert_eq!(run(OpKind::AveragePool(attrs), &[x]).data, vec![2.0]);
    }

    #[test]
    fn test_gemm_trans_b_with_bias() {
        let a = Activation::new(vec![1, 2], vec![1.0, 2.0]);
        let b = Activation::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]);
        let c = Activation::new(vec![2], vec![10.0, 20.0]);
        let gemm = OpKind::Gemm(crate::ir::GemmAttrs {
            trans_b: true,
            ..Default::default()
        });
        let y = run(gemm, &[a, b, c]);
        assert_eq!(y.shape, vec![1, 2]);
        assert_eq!(y.data, vec![11.0, 22.0]);
    }

    #[test]
    fn test_concat_on_channels() {
        let a = Activation::new(vec![1, 1, 1, 2], vec![1.0, 2.0]);
        let b = Activation::new(vec![1, 1, 1, 2], vec![3.0, 4.0]);
        let y = run(OpKind::Concat { axis: 1 }, &[a, b]);
        assert_eq!(y.shape, vec![1, 2, 1, 2]);
        assert_eq!(y.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = Activation::new(vec![1, 3], vec![1.0, 2.0, 3.0]);
        let y = run(OpKind::Softmax { axis: 1 }, &[x]);
        let total: f32 = y.data.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(y.data[2] > y.data[1]);
    }

    #[test]
    fn test_reshape_infers_dimension() {
        let x = Activation::new(vec![1, 2, 2], vec![0.0; 4]);
        let y = run(
            OpKind::Reshape {
                shape: vec![0, -1],
            },
            &[x],
        );
        assert_eq!(y.shape, vec![1, 4]);
    }

    #[test]
    fn test_reduce_prod_over_axis() {
        let x = Activation::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let y = run(
            OpKind::ReduceProd {
                axes: vec![1],
                keepdims: false,
            },
            &[x],
        );
        assert_eq!(y.shape, vec![2]);
        assert_eq!(y.data, vec![2.0, 12.0]);
    }

    #[test]
    fn test_random_normal_is_not_executable() {
        let g = single_op(
            OpKind::RandomNormal(crate::ir::RandomNormalAttrs {
                shape: vec![1],
                dtype: 1,
                mean: 0.0,
                scale: 1.0,
                seed: None,
            }),
            0,
        );
        let err = ReferenceOracle.execute(&g, OpId(0), &[]).unwrap_err();
        assert!(matches!(err, OracleError::Unsupported { .. }));
    }
}
