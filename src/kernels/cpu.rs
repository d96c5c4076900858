//! Parallel CPU kernels.
//!
//! Host reference implementations of the kernel set, used by the `Cpu`
//! backend. Rows are processed in parallel with [`rayon`]; each kernel
//! follows the same numerics as its WGSL counterpart (row-max subtraction in
//! softmax and cross-entropy, log-sum-exp for the loss).
//!
//! Output buffers may be wider than the logical result; only the leading
//! `m * n` elements are touched.

use super::{Kernel, Launch, Params};
use crate::device::HostDevice;
use crate::error::Result;
use rayon::prelude::*;

pub(crate) fn run(host: &mut HostDevice, launch: &Launch<'_>) -> Result<()> {
    let mut output = host.take(launch.output)?;
    let inputs: Result<Vec<&[f32]>> = launch.inputs.iter().map(|&id| host.buffer(id)).collect();
    let result = inputs.map(|inputs| execute(launch.kernel, &launch.params, &inputs, &mut output));
    host.put(launch.output, output);
    result
}

fn execute(kernel: Kernel, params: &Params, inputs: &[&[f32]], output: &mut [f32]) {
    let (m, n, k) = (params.m as usize, params.n as usize, params.k as usize);
    match kernel {
        Kernel::MatMul => matmul(inputs[0], inputs[1], &mut output[..m * n], k, n),
        Kernel::Add => zip_map(inputs[0], inputs[1], &mut output[..m * n], |a, b| a + b),
        Kernel::Mul => zip_map(inputs[0], inputs[1], &mut output[..m * n], |a, b| a * b),
        Kernel::BiasAdd => bias_add(inputs[0], inputs[1], &mut output[..m * n], n),
        Kernel::Relu => output[..m * n]
            .par_iter_mut()
            .zip(inputs[0].par_iter())
            .for_each(|(o, &x)| *o = x.max(0.0)),
        Kernel::ReluBackward => zip_map(inputs[0], inputs[1], &mut output[..m * n], |grad, x| {
            if x > 0.0 { grad } else { 0.0 }
        }),
        Kernel::Softmax => softmax(inputs[0], &mut output[..m * n], n),
        Kernel::SoftmaxBackward => softmax_backward(inputs[0], inputs[1], &mut output[..m * n], n),
        Kernel::CrossEntropy => cross_entropy(inputs[0], inputs[1], &mut output[..m], n),
        Kernel::SoftmaxCrossEntropyBackward => {
            softmax_cross_entropy_backward(inputs[0], inputs[1], inputs[2], &mut output[..m * n], n)
        }
        Kernel::Transpose => transpose(inputs[0], &mut output[..m * n], m, n),
        Kernel::SumAll => output[0] = inputs[0][..m].par_iter().sum(),
        Kernel::SumReduce => sum_reduce(inputs[0], &mut output[..n], m, n),
        Kernel::InplaceAdd => output[..m * n]
            .par_iter_mut()
            .zip(inputs[0].par_iter())
            .for_each(|(o, &x)| *o += x),
        Kernel::ScalarMul => {
            let scalar = params.scalar;
            output[..m * n]
                .par_iter_mut()
                .zip(inputs[0].par_iter())
                .for_each(|(o, &x)| *o = x * scalar);
        }
        Kernel::ClipGradNorm => clip_grad_norm(&mut output[..m], params.scalar),
    }
}

fn zip_map(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32 + Sync) {
    out.par_iter_mut()
        .zip(a.par_iter().zip(b.par_iter()))
        .for_each(|(o, (&x, &y))| *o = f(x, y));
}

/// `out[m, n] = a[m, k] · b[k, n]`, one output row per task.
fn matmul(a: &[f32], b: &[f32], out: &mut [f32], k: usize, n: usize) {
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        row.fill(0.0);
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &b_pj) in row.iter_mut().zip(b_row) {
                *o += a_ip * b_pj;
            }
        }
    });
}

fn bias_add(x: &[f32], bias: &[f32], out: &mut [f32], n: usize) {
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let x_row = &x[i * n..(i + 1) * n];
        for ((o, &v), &b) in row.iter_mut().zip(x_row).zip(&bias[..n]) {
            *o = v + b;
        }
    });
}

fn row_max(row: &[f32]) -> f32 {
    row.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

fn softmax(x: &[f32], out: &mut [f32], n: usize) {
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let z = &x[i * n..(i + 1) * n];
        softmax_row(z, row);
    });
}

fn softmax_row(z: &[f32], out: &mut [f32]) {
    let max = row_max(z);
    let mut total = 0.0;
    for (o, &v) in out.iter_mut().zip(z) {
        *o = (v - max).exp();
        total += *o;
    }
    for o in out.iter_mut() {
        *o /= total;
    }
}

fn softmax_backward(grad: &[f32], probs: &[f32], out: &mut [f32], n: usize) {
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let g = &grad[i * n..(i + 1) * n];
        let s = &probs[i * n..(i + 1) * n];
        let dot: f32 = g.iter().zip(s).map(|(g, s)| g * s).sum();
        for ((o, &g), &s) in row.iter_mut().zip(g).zip(s) {
            *o = s * (g - dot);
        }
    });
}

/// Per-row `Σ y · (logsumexp(z) − z)`.
fn cross_entropy(logits: &[f32], labels: &[f32], out: &mut [f32], n: usize) {
    out.par_iter_mut().enumerate().for_each(|(i, loss)| {
        let z = &logits[i * n..(i + 1) * n];
        let y = &labels[i * n..(i + 1) * n];
        let max = row_max(z);
        let lse = max + z.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        *loss = z.iter().zip(y).map(|(&z, &y)| y * (lse - z)).sum();
    });
}

fn softmax_cross_entropy_backward(
    logits: &[f32],
    labels: &[f32],
    grad: &[f32],
    out: &mut [f32],
    n: usize,
) {
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        softmax_row(&logits[i * n..(i + 1) * n], row);
        let y = &labels[i * n..(i + 1) * n];
        for (o, &y) in row.iter_mut().zip(y) {
            *o = grad[i] * (*o - y);
        }
    });
}

/// `out[n, m]` from `x[m, n]`.
fn transpose(x: &[f32], out: &mut [f32], m: usize, n: usize) {
    out.par_chunks_mut(m).enumerate().for_each(|(col, row)| {
        for (r, o) in row.iter_mut().enumerate() {
            *o = x[r * n + col];
        }
    });
}

fn sum_reduce(x: &[f32], out: &mut [f32], m: usize, n: usize) {
    out.par_iter_mut().enumerate().for_each(|(col, o)| {
        *o = (0..m).map(|row| x[row * n + col]).sum();
    });
}

fn clip_grad_norm(grad: &mut [f32], max_norm: f32) {
    let norm = grad.par_iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        grad.par_iter_mut().for_each(|g| *g *= scale);
    }
}
