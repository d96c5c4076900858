//! Kernel entry points.
//!
//! Each method validates ranks and shapes before any device work, allocates
//! its output in the active scope unless one is supplied, dispatches the
//! kernel and, for differentiable operations, records the output's parents and
//! [`GradFn`] when an input requires gradients and recording is enabled.
//! A caller-supplied output is written but never linked into the graph, and
//! one that already requires gradients is rejected.
//!
//! | op | output | differentiable |
//! |---|---|---|
//! | [`matmul`](Runtime::matmul) | `[M, N]` | yes |
//! | [`add`](Runtime::add) | same | yes |
//! | [`bias_add`](Runtime::bias_add) | same | yes |
//! | [`relu`](Runtime::relu) | same | yes |
//! | [`softmax`](Runtime::softmax) | same | yes |
//! | [`cross_entropy`](Runtime::cross_entropy) | `[M, 1]` | yes, fused with softmax |
//! | [`dropout`](Runtime::dropout) | same | yes |
//! | everything else | | no |

use crate::autograd::GradFn;
use crate::error::{Error, Result};
use crate::kernels::{Kernel, Launch, Params, REDUCTION_WARN_THRESHOLD};
use crate::runtime::Runtime;
use crate::tensor::{BufferId, BufferUsage, Shape, TensorId};

impl Runtime {
    /// `C = A · B` for `A: [M, K]`, `B: [K, N]`.
    pub fn matmul(&mut self, a: TensorId, b: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let (sa, sb) = (self.shape(a)?, self.shape(b)?);
        if sa.cols != sb.rows {
            return Err(Error::ShapeMismatch {
                op: "matmul",
                lhs: sa,
                rhs: sb,
            });
        }
        let supplied = out.is_some();
        let out = self.output("matmul", out, Shape::new(sa.rows, sb.cols))?;
        let params = Params::matrix(sa.rows, sb.cols).with_k(sa.cols);
        self.launch(Kernel::MatMul, params, &[a, b], out)?;
        self.track(out, supplied, &[a, b], GradFn::MatMul { a, b })?;
        Ok(out)
    }

    /// Elementwise `A + B`.
    pub fn add(&mut self, a: TensorId, b: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("add", a, b)?;
        let supplied = out.is_some();
        let out = self.output("add", out, shape)?;
        self.launch(Kernel::Add, Params::matrix(shape.rows, shape.cols), &[a, b], out)?;
        self.track(out, supplied, &[a, b], GradFn::Add)?;
        Ok(out)
    }

    /// Elementwise `A ⊙ B`. Not recorded in the graph.
    pub fn mul(&mut self, a: TensorId, b: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("mul", a, b)?;
        let out = self.output("mul", out, shape)?;
        self.launch(Kernel::Mul, Params::matrix(shape.rows, shape.cols), &[a, b], out)?;
        Ok(out)
    }

    /// `Y = X + bias` with `bias: [1, N]` broadcast over the rows of `X: [M, N]`.
    pub fn bias_add(&mut self, x: TensorId, bias: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let (shape, sb) = (self.shape(x)?, self.shape(bias)?);
        if sb.rows != 1 || sb.cols != shape.cols {
            return Err(Error::BiasShape {
                bias: sb,
                cols: shape.cols,
            });
        }
        let supplied = out.is_some();
        let out = self.output("bias_add", out, shape)?;
        self.launch(Kernel::BiasAdd, Params::matrix(shape.rows, shape.cols), &[x, bias], out)?;
        self.track(out, supplied, &[x, bias], GradFn::BiasAdd { input: x, bias })?;
        Ok(out)
    }

    /// `max(0, X)`.
    pub fn relu(&mut self, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        let supplied = out.is_some();
        let out = self.output("relu", out, shape)?;
        self.launch(Kernel::Relu, Params::matrix(shape.rows, shape.cols), &[x], out)?;
        self.track(out, supplied, &[x], GradFn::Relu { input: x })?;
        Ok(out)
    }

    /// `dY ⊙ (X > 0)`.
    pub fn relu_backward(&mut self, grad: TensorId, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("relu_backward", grad, x)?;
        let out = self.output("relu_backward", out, shape)?;
        self.launch(Kernel::ReluBackward, Params::matrix(shape.rows, shape.cols), &[grad, x], out)?;
        Ok(out)
    }

    /// Row-wise softmax.
    pub fn softmax(&mut self, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        let supplied = out.is_some();
        let out = self.output("softmax", out, shape)?;
        self.launch(Kernel::Softmax, Params::matrix(shape.rows, shape.cols), &[x], out)?;
        self.track(out, supplied, &[x], GradFn::Softmax { output: out })?;
        Ok(out)
    }

    /// `S ⊙ (dS − rowSum(dS ⊙ S))` given the softmax output `S`.
    pub fn softmax_backward(&mut self, grad: TensorId, probs: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("softmax_backward", grad, probs)?;
        let out = self.output("softmax_backward", out, shape)?;
        self.launch(Kernel::SoftmaxBackward, Params::matrix(shape.rows, shape.cols), &[grad, probs], out)?;
        Ok(out)
    }

    /// Per-row cross-entropy of `softmax(logits)` against `labels`, shaped `[M, 1]`.
    ///
    /// Differentiating the result goes straight to the logits through the
    /// fused `softmax(Z) − labels` rule; labels never receive a gradient.
    pub fn cross_entropy(&mut self, logits: TensorId, labels: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("cross_entropy", logits, labels)?;
        let supplied = out.is_some();
        let out = self.output("cross_entropy", out, Shape::new(shape.rows, 1))?;
        self.launch(Kernel::CrossEntropy, Params::matrix(shape.rows, shape.cols), &[logits, labels], out)?;
        self.track(out, supplied, &[logits], GradFn::SoftmaxCrossEntropy { logits, labels })?;
        Ok(out)
    }

    /// `grad[row] · (softmax(logits) − labels)`, with `grad: [M, 1]`.
    pub fn softmax_cross_entropy_backward(
        &mut self,
        logits: TensorId,
        labels: TensorId,
        grad: TensorId,
        out: Option<TensorId>,
    ) -> Result<TensorId> {
        let shape = self.same_shape("softmax_cross_entropy_backward", logits, labels)?;
        let sg = self.shape(grad)?;
        if sg != Shape::new(shape.rows, 1) {
            return Err(Error::ShapeMismatch {
                op: "softmax_cross_entropy_backward",
                lhs: shape,
                rhs: sg,
            });
        }
        let out = self.output("softmax_cross_entropy_backward", out, shape)?;
        self.launch(
            Kernel::SoftmaxCrossEntropyBackward,
            Params::matrix(shape.rows, shape.cols),
            &[logits, labels, grad],
            out,
        )?;
        Ok(out)
    }

    /// `X ⊙ mask` with a caller-generated mask; the same mask scales the gradient.
    pub fn dropout(&mut self, x: TensorId, mask: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.same_shape("dropout", x, mask)?;
        let supplied = out.is_some();
        let out = self.output("dropout", out, shape)?;
        self.launch(Kernel::Mul, Params::matrix(shape.rows, shape.cols), &[x, mask], out)?;
        self.track(out, supplied, &[x], GradFn::Dropout { mask })?;
        Ok(out)
    }

    /// `Xᵗ`.
    pub fn transpose(&mut self, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        let out = self.output("transpose", out, shape.transposed())?;
        self.launch(Kernel::Transpose, Params::matrix(shape.rows, shape.cols), &[x], out)?;
        Ok(out)
    }

    /// Sum of every element, shaped `[1, 1]`.
    pub fn sum_all(&mut self, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        warn_oversized("sum_all", shape.len());
        let out = self.output("sum_all", out, Shape::new(1, 1))?;
        self.launch(Kernel::SumAll, Params::matrix(shape.len(), 1), &[x], out)?;
        Ok(out)
    }

    /// Column sums, shaped `[1, N]`.
    pub fn sum_reduce(&mut self, x: TensorId, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        warn_oversized("sum_reduce", shape.rows);
        let out = self.output("sum_reduce", out, Shape::row(shape.cols))?;
        self.launch(Kernel::SumReduce, Params::matrix(shape.rows, shape.cols), &[x], out)?;
        Ok(out)
    }

    /// `dst += src`.
    pub fn inplace_add(&mut self, dst: TensorId, src: TensorId) -> Result<()> {
        let shape = self.same_shape("inplace_add", dst, src)?;
        self.launch(Kernel::InplaceAdd, Params::matrix(shape.rows, shape.cols), &[src], dst)
    }

    /// `X · scalar`.
    pub fn scalar_mul(&mut self, x: TensorId, scalar: f32, out: Option<TensorId>) -> Result<TensorId> {
        let shape = self.shape(x)?;
        let out = self.output("scalar_mul", out, shape)?;
        let params = Params::matrix(shape.rows, shape.cols).with_scalar(scalar);
        self.launch(Kernel::ScalarMul, params, &[x], out)?;
        Ok(out)
    }

    /// Rescales `grad` in place so its L2 norm does not exceed `max_norm`.
    pub fn clip_grad_norm(&mut self, grad: TensorId, max_norm: f32) -> Result<()> {
        let shape = self.shape(grad)?;
        warn_oversized("clip_grad_norm", shape.len());
        let params = Params::matrix(shape.len(), 1).with_scalar(max_norm);
        self.launch(Kernel::ClipGradNorm, params, &[], grad)
    }

    fn same_shape(&self, op: &'static str, a: TensorId, b: TensorId) -> Result<Shape> {
        let (sa, sb) = (self.shape(a)?, self.shape(b)?);
        if sa != sb {
            return Err(Error::ShapeMismatch { op, lhs: sa, rhs: sb });
        }
        Ok(sa)
    }

    fn output(&mut self, op: &'static str, out: Option<TensorId>, shape: Shape) -> Result<TensorId> {
        match out {
            Some(id) => {
                let actual = self.shape(id)?;
                if actual != shape {
                    return Err(Error::OutputShape {
                        op,
                        output: actual,
                        expected: shape,
                    });
                }
                let record = self.buffers.tensor(id)?;
                if record.requires_grad || record.grad_fn.is_some() {
                    return Err(Error::OutputInGraph {
                        op,
                        name: record.name.clone(),
                    });
                }
                Ok(id)
            }
            None => self.buffers.get_scoped(BufferUsage::TENSOR, shape, None),
        }
    }

    fn launch(&mut self, kernel: Kernel, params: Params, inputs: &[TensorId], output: TensorId) -> Result<()> {
        let inputs = inputs
            .iter()
            .map(|&id| Ok(self.buffers.tensor(id)?.buffer))
            .collect::<Result<Vec<BufferId>>>()?;
        let output = self.buffers.tensor(output)?.buffer;
        if inputs.contains(&output) {
            return Err(Error::Aliasing {
                op: kernel.label(),
                buffer: output,
            });
        }
        let launch = Launch {
            kernel,
            params,
            inputs: &inputs,
            output,
        };
        self.kernels.dispatch(self.buffers.device_mut(), &launch)
    }

    /// Links a freshly allocated `output` into the graph when recording is on
    /// and a parent requires gradients. Caller-supplied outputs are never linked.
    fn track(&mut self, output: TensorId, supplied: bool, parents: &[TensorId], grad_fn: GradFn) -> Result<()> {
        if supplied || !self.is_grad_enabled() {
            return Ok(());
        }
        let mut needs_grad = false;
        for &parent in parents {
            needs_grad |= self.requires_grad(parent)?;
        }
        if needs_grad {
            let record = self.buffers.tensor_mut(output)?;
            record.requires_grad = true;
            record.parents = parents.to_vec();
            record.grad_fn = Some(grad_fn);
        }
        Ok(())
    }
}

fn warn_oversized(op: &str, len: usize) {
    if len > REDUCTION_WARN_THRESHOLD {
        log::warn!(
            "{op} over {len} elements exceeds the single-workgroup reduction limit of \
             {REDUCTION_WARN_THRESHOLD}; precision may suffer"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_errors_precede_allocation() {
        let mut rt = Runtime::cpu();
        let a = rt.tensor("a", Shape::new(2, 3), &[0.0; 6]).unwrap();
        let b = rt.tensor("b", Shape::new(2, 3), &[0.0; 6]).unwrap();
        let live = rt.buffers().live_buffers();

        assert!(matches!(
            rt.matmul(a, b, None),
            Err(Error::ShapeMismatch { op: "matmul", .. })
        ));
        assert!(matches!(rt.bias_add(a, b, None), Err(Error::BiasShape { cols: 3, .. })));
        assert_eq!(rt.buffers().live_buffers(), live);
    }

    #[test]
    fn rejects_aliased_output() {
        let mut rt = Runtime::cpu();
        let a = rt.tensor("a", Shape::new(2, 2), &[1.0; 4]).unwrap();
        assert!(matches!(rt.relu(a, Some(a)), Err(Error::Aliasing { op: "relu", .. })));
    }

    #[test]
    fn reuses_caller_output() {
        let mut rt = Runtime::cpu();
        let a = rt.tensor("a", Shape::new(1, 3), &[-1.0, 0.5, 2.0]).unwrap();
        let out = rt.tensor("out", Shape::new(1, 3), &[9.0; 3]).unwrap();
        assert_eq!(rt.relu(a, Some(out)).unwrap(), out);
        assert_eq!(rt.read_tensor(out).unwrap(), vec![0.0, 0.5, 2.0]);

        let wrong = rt.tensor("wrong", Shape::new(3, 1), &[0.0; 3]).unwrap();
        assert!(matches!(
            rt.relu(a, Some(wrong)),
            Err(Error::OutputShape { op: "relu", .. })
        ));
    }

    #[test]
    fn supplied_outputs_keep_their_graph_state() {
        let mut rt = Runtime::cpu();
        let a = rt.tensor("a", Shape::new(1, 2), &[1.0, -1.0]).unwrap();
        let p = rt.parameter("p", Shape::new(1, 2), &[0.5, 0.5]).unwrap();

        assert!(matches!(
            rt.relu(a, Some(p)),
            Err(Error::OutputInGraph { op: "relu", ref name }) if name == "p"
        ));
        assert!(rt.requires_grad(p).unwrap());
        assert_eq!(rt.read_tensor(p).unwrap(), vec![0.5, 0.5]);

        let out = rt.tensor("out", Shape::new(1, 2), &[0.0; 2]).unwrap();
        rt.relu(p, Some(out)).unwrap();
        assert!(!rt.requires_grad(out).unwrap());
        assert!(rt.record(out).unwrap().grad_fn().is_none());
        assert_eq!(rt.read_tensor(out).unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn records_only_when_inputs_require_grad() {
        let mut rt = Runtime::cpu();
        let x = rt.tensor("x", Shape::new(1, 2), &[1.0, -1.0]).unwrap();
        let y = rt.relu(x, None).unwrap();
        assert!(!rt.requires_grad(y).unwrap());
        assert!(rt.record(y).unwrap().grad_fn().is_none());

        rt.set_requires_grad(x, true).unwrap();
        let y = rt.relu(x, None).unwrap();
        assert!(rt.requires_grad(y).unwrap());
        assert_eq!(rt.record(y).unwrap().parents(), &[x]);

        let z = rt.no_grad(|rt| rt.relu(x, None)).unwrap();
        assert!(!rt.requires_grad(z).unwrap());
    }
}
