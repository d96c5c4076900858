#![cfg(feature = "wgpu")]

use gpugrad::approx::{ApproxEquality, RelativeEq};
use gpugrad::{Backend, Runtime, RuntimeConfig, Shape};

fn gpu_runtime() -> Option<Runtime> {
    match Runtime::new(RuntimeConfig::default().with_backend(Backend::Wgpu)) {
        Ok(rt) => Some(rt),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

fn inputs() -> (Vec<f32>, Vec<f32>) {
    let a = (0..40 * 33).map(|i| ((i % 13) as f32 - 6.0) * 0.1).collect();
    let b = (0..33 * 18).map(|i| ((i % 7) as f32 - 3.0) * 0.2).collect();
    (a, b)
}

#[test]
fn test_matmul_matches_host() {
    let Some(mut gpu) = gpu_runtime() else { return };
    let mut cpu = Runtime::cpu();
    let (a, b) = inputs();

    let mut results = Vec::new();
    for rt in [&mut gpu, &mut cpu] {
        let ta = rt.tensor("a", Shape::new(40, 33), &a).unwrap();
        let tb = rt.tensor("b", Shape::new(33, 18), &b).unwrap();
        let c = rt.matmul(ta, tb, None).unwrap();
        results.push(rt.read_tensor(c).unwrap());
    }
    assert_ne!(results[0].approx_eq(&results[1]), ApproxEquality::Scarce);
}

#[test]
fn test_softmax_cross_entropy_backward_matches_host() {
    let Some(mut gpu) = gpu_runtime() else { return };
    let mut cpu = Runtime::cpu();
    let logits: Vec<f32> = (0..30).map(|i| (i as f32 * 0.37).sin() * 4.0).collect();
    let mut labels = vec![0.0; 30];
    for row in 0..3 {
        labels[row * 10 + row * 3] = 1.0;
    }

    let mut grads = Vec::new();
    for rt in [&mut gpu, &mut cpu] {
        let z = rt.parameter("z", Shape::new(3, 10), &logits).unwrap();
        let y = rt.tensor("y", Shape::new(3, 10), &labels).unwrap();
        let loss = rt.cross_entropy(z, y, None).unwrap();
        rt.backward(loss).unwrap();
        rt.synchronize().unwrap();
        let grad = rt.gradient(z).unwrap();
        grads.push(rt.read_tensor(grad).unwrap());
    }
    assert_ne!(grads[0].approx_eq(&grads[1]), ApproxEquality::Scarce);
}

#[test]
fn test_reductions_match_host() {
    let Some(mut gpu) = gpu_runtime() else { return };
    let mut cpu = Runtime::cpu();
    let data: Vec<f32> = (0..777).map(|i| (i % 11) as f32 * 0.25).collect();

    let mut sums = Vec::new();
    for rt in [&mut gpu, &mut cpu] {
        let x = rt.tensor("x", Shape::new(259, 3), &data).unwrap();
        let total = rt.sum_all(x, None).unwrap();
        let cols = rt.sum_reduce(x, None).unwrap();
        let mut values = rt.read_tensor(total).unwrap();
        values.extend(rt.read_tensor(cols).unwrap());
        sums.push(values);
    }
    assert_ne!(sums[0].approx_eq(&sums[1]), ApproxEquality::Scarce);
    gpu.destroy_all().unwrap();
}
