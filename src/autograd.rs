//! Reverse-mode automatic differentiation over the tensor arena.
//!
//! Differentiable kernels attach a [`GradFn`] and the list of parent ids to
//! their output (see [`crate::ops`]). [`backward`] then:
//!
//! 1. orders every tensor reachable from the loss that requires gradients,
//!    parents before children, with an iterative depth-first search;
//! 2. clears their gradients and seeds the loss gradient with ones;
//! 3. walks the order back to front, asking each [`GradFn`] for one
//!    contribution per parent and accumulating it into the parent's
//!    persistent `<name>_grad` tensor with the in-place add kernel.
//!
//! Gradients are accumulated, never assigned, so a tensor read by several
//! consumers receives the sum of their contributions.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::tensor::{BufferUsage, TensorId, TensorRecord};
use log::debug;

/// Local derivative of a recorded forward operation.
///
/// Each variant keeps only the tensors its backward rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradFn {
    /// `C = A · B`: `dA = dC · Bᵗ`, `dB = Aᵗ · dC`.
    MatMul { a: TensorId, b: TensorId },
    /// `C = A + B`: both parents receive `dC`.
    Add,
    /// `Y = X + bias`: `dX = dY`, `dbias = colSum(dY)`.
    BiasAdd { input: TensorId, bias: TensorId },
    /// `Y = max(0, X)`: `dX = dY ⊙ (X > 0)`.
    Relu { input: TensorId },
    /// `S = softmax(X)`: `dX = S ⊙ (dS − rowSum(dS ⊙ S))`.
    Softmax { output: TensorId },
    /// `L = CE(softmax(Z), labels)`: `dZ = dL · (softmax(Z) − labels)`.
    SoftmaxCrossEntropy { logits: TensorId, labels: TensorId },
    /// `Y = X ⊙ mask`: `dX = dY ⊙ mask`.
    Dropout { mask: TensorId },
}

/// Computes one gradient contribution per parent of a node whose output
/// gradient is `grad`. Contributions for parents that do not require
/// gradients are skipped and reported as `None`.
pub(crate) fn compute_backward(
    rt: &mut Runtime,
    grad_fn: GradFn,
    parents: &[TensorId],
    grad: TensorId,
) -> Result<Vec<Option<TensorId>>> {
    match grad_fn {
        GradFn::MatMul { a, b } => {
            let da = if rt.requires_grad(a)? {
                let bt = rt.transpose(b, None)?;
                Some(rt.matmul(grad, bt, None)?)
            } else {
                None
            };
            let db = if rt.requires_grad(b)? {
                let at = rt.transpose(a, None)?;
                Some(rt.matmul(at, grad, None)?)
            } else {
                None
            };
            Ok(vec![da, db])
        }
        GradFn::Add => parents
            .iter()
            .map(|&parent| Ok(rt.requires_grad(parent)?.then_some(grad)))
            .collect(),
        GradFn::BiasAdd { input, bias } => {
            let dx = rt.requires_grad(input)?.then_some(grad);
            let dbias = if rt.requires_grad(bias)? {
                Some(rt.sum_reduce(grad, None)?)
            } else {
                None
            };
            Ok(vec![dx, dbias])
        }
        GradFn::Relu { input } => Ok(vec![Some(rt.relu_backward(grad, input, None)?)]),
        GradFn::Softmax { output } => Ok(vec![Some(rt.softmax_backward(grad, output, None)?)]),
        GradFn::SoftmaxCrossEntropy { logits, labels } => Ok(vec![Some(
            rt.softmax_cross_entropy_backward(logits, labels, grad, None)?,
        )]),
        GradFn::Dropout { mask } => Ok(vec![Some(rt.mul(grad, mask, None)?)]),
    }
}

/// Tensors reachable from `root` through parents that require gradients,
/// each listed after all of its parents.
pub(crate) fn topological_order(tensors: &[TensorRecord], root: TensorId) -> Vec<TensorId> {
    let mut visited = vec![false; tensors.len()];
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];

    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        let Some(record) = tensors.get(id.index()) else {
            continue;
        };
        if visited[id.index()] || !record.requires_grad {
            continue;
        }
        visited[id.index()] = true;
        stack.push((id, true));
        for &parent in record.parents.iter().rev() {
            if !visited.get(parent.index()).copied().unwrap_or(true) {
                stack.push((parent, false));
            }
        }
    }
    order
}

pub(crate) fn backward(rt: &mut Runtime, loss: TensorId) -> Result<()> {
    let record = rt.buffers.tensor(loss)?;
    if !record.requires_grad {
        return Err(Error::NotDifferentiable(record.name.clone()));
    }
    let shape = record.shape;

    let order = topological_order(rt.buffers.records(), loss);
    debug!("backward from {loss} over {} tensors", order.len());
    for &id in &order {
        rt.buffers.tensor_mut(id)?.grad = None;
    }
    let seed = rt.ones(shape)?;
    rt.buffers.tensor_mut(loss)?.grad = Some(seed);

    rt.no_grad(|rt| replay(rt, &order))
}

fn replay(rt: &mut Runtime, order: &[TensorId]) -> Result<()> {
    for &id in order.iter().rev() {
        let record = rt.buffers.tensor(id)?;
        let (Some(grad_fn), Some(grad)) = (record.grad_fn, record.grad) else {
            continue;
        };
        let parents = record.parents.clone();
        let contributions = compute_backward(rt, grad_fn, &parents, grad)?;

        for (&parent, contribution) in parents.iter().zip(contributions) {
            let Some(contribution) = contribution else {
                continue;
            };
            if let Some(target) = gradient_slot(rt, parent)? {
                rt.inplace_add(target, contribution)?;
            }
        }
    }
    Ok(())
}

/// The gradient tensor of `parent`, allocated zeroed on first use.
fn gradient_slot(rt: &mut Runtime, parent: TensorId) -> Result<Option<TensorId>> {
    let record = rt.buffers.tensor(parent)?;
    if !record.requires_grad {
        return Ok(None);
    }
    if let Some(grad) = record.grad {
        return Ok(Some(grad));
    }
    let name = format!("{}_grad", record.name);
    let shape = record.shape;
    let zeros = vec![0.0; shape.len()];
    let grad = rt
        .buffers
        .get_or_create(&name, BufferUsage::TENSOR, shape, Some(&zeros))?;
    rt.buffers.tensor_mut(parent)?.grad = Some(grad);
    Ok(Some(grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    #[test]
    fn order_lists_parents_first_and_skips_constants() {
        let mut rt = Runtime::cpu();
        let x = rt.parameter("x", Shape::new(1, 2), &[1.0, 2.0]).unwrap();
        let c = rt.tensor("c", Shape::new(1, 2), &[3.0, 4.0]).unwrap();
        let y1 = rt.relu(x, None).unwrap();
        let y2 = rt.add(x, c, None).unwrap();
        let loss = rt.add(y1, y2, None).unwrap();

        let order = topological_order(rt.buffers.records(), loss);
        assert_eq!(order.len(), 4);
        assert!(!order.contains(&c));
        assert_eq!(order[0], x);
        assert_eq!(*order.last().unwrap(), loss);
        let pos = |id| order.iter().position(|&o| o == id).unwrap();
        assert!(pos(y1) < pos(loss) && pos(y2) < pos(loss));
    }

    #[test]
    fn backward_requires_a_differentiable_root() {
        let mut rt = Runtime::cpu();
        let x = rt.tensor("x", Shape::new(1, 1), &[1.0]).unwrap();
        assert!(matches!(rt.backward(x), Err(Error::NotDifferentiable(name)) if name == "x"));
        assert!(matches!(rt.gradient(x), Err(Error::MissingGradient(_))));
    }

    #[test]
    fn gradients_land_in_named_buffers() {
        let mut rt = Runtime::cpu();
        let x = rt.parameter("x", Shape::new(1, 3), &[-1.0, 2.0, 3.0]).unwrap();
        let y = rt.relu(x, None).unwrap();
        rt.backward(y).unwrap();

        let grad = rt.gradient(x).unwrap();
        assert_eq!(rt.name(grad).unwrap(), "x_grad");
        assert_eq!(rt.read_tensor(grad).unwrap(), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn repeated_backward_does_not_accumulate_across_passes() {
        let mut rt = Runtime::cpu();
        let x = rt.parameter("x", Shape::new(1, 2), &[1.0, 2.0]).unwrap();
        for _ in 0..3 {
            rt.begin_scope("fwd");
            let y = rt.relu(x, None).unwrap();
            rt.backward(y).unwrap();
        }
        let grad = rt.gradient(x).unwrap();
        assert_eq!(rt.read_tensor(grad).unwrap(), vec![1.0, 1.0]);
    }
}
