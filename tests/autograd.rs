use gpugrad::{Error, GradFn, Result, Runtime, Shape, TensorId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const STEP: f32 = 1e-2;
const TOLERANCE: f32 = 2e-2;

fn random(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Sum of the output of `f`, evaluated outside the graph.
fn evaluate(rt: &mut Runtime, f: &dyn Fn(&mut Runtime) -> Result<TensorId>) -> f32 {
    rt.begin_scope("probe");
    let out = rt.no_grad(|rt| f(rt)).unwrap();
    rt.read_tensor(out).unwrap().iter().sum()
}

/// Compares backward gradients of `sum(f())` against central differences.
fn check_gradients(rt: &mut Runtime, params: &[TensorId], f: &dyn Fn(&mut Runtime) -> Result<TensorId>) {
    rt.begin_scope("fwd");
    let out = f(rt).unwrap();
    rt.backward(out).unwrap();

    let analytic: Vec<Vec<f32>> = params
        .iter()
        .map(|&p| {
            let grad = rt.gradient(p).unwrap();
            rt.read_tensor(grad).unwrap()
        })
        .collect();

    for (&param, analytic) in params.iter().zip(analytic) {
        let mut values = rt.read_tensor(param).unwrap();
        for i in 0..values.len() {
            let original = values[i];
            values[i] = original + STEP;
            rt.write_tensor(param, &values).unwrap();
            let plus = evaluate(rt, f);
            values[i] = original - STEP;
            rt.write_tensor(param, &values).unwrap();
            let minus = evaluate(rt, f);
            values[i] = original;
            rt.write_tensor(param, &values).unwrap();

            let numeric = (plus - minus) / (2.0 * STEP);
            let scale = numeric.abs().max(analytic[i].abs()).max(1.0);
            assert!(
                (numeric - analytic[i]).abs() / scale < TOLERANCE,
                "{}[{i}]: analytic {} vs numeric {numeric}",
                rt.name(param).unwrap(),
                analytic[i],
            );
        }
    }
}

#[test]
fn test_matmul_gradients() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut rt = Runtime::cpu();
    let a = rt.parameter("a", Shape::new(3, 4), &random(&mut rng, 12)).unwrap();
    let b = rt.parameter("b", Shape::new(4, 2), &random(&mut rng, 8)).unwrap();
    check_gradients(&mut rt, &[a, b], &|rt| rt.matmul(a, b, None));
}

#[test]
fn test_bias_add_gradients() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut rt = Runtime::cpu();
    let x = rt.parameter("x", Shape::new(5, 3), &random(&mut rng, 15)).unwrap();
    let bias = rt.parameter("bias", Shape::row(3), &random(&mut rng, 3)).unwrap();
    let w = rt.tensor("w", Shape::new(3, 1), &random(&mut rng, 3)).unwrap();
    check_gradients(&mut rt, &[x, bias], &|rt| {
        let y = rt.bias_add(x, bias, None)?;
        rt.matmul(y, w, None)
    });

    let grad = rt.gradient(bias).unwrap();
    assert_eq!(rt.shape(grad).unwrap(), Shape::row(3));
}

#[test]
fn test_relu_gradients() {
    let mut rt = Runtime::cpu();
    let x = rt
        .parameter("x", Shape::new(2, 3), &[-0.8, 0.5, 0.3, -0.2, 1.2, -1.5])
        .unwrap();
    let w = rt.tensor("w", Shape::new(3, 1), &[0.7, -1.1, 0.4]).unwrap();
    check_gradients(&mut rt, &[x], &|rt| {
        let y = rt.relu(x, None)?;
        rt.matmul(y, w, None)
    });
}

#[test]
fn test_softmax_gradients() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut rt = Runtime::cpu();
    let x = rt.parameter("x", Shape::new(3, 4), &random(&mut rng, 12)).unwrap();
    let w = rt.tensor("w", Shape::new(4, 1), &[1.0, -2.0, 0.5, 3.0]).unwrap();
    check_gradients(&mut rt, &[x], &|rt| {
        let p = rt.softmax(x, None)?;
        rt.matmul(p, w, None)
    });
}

#[test]
fn test_fused_cross_entropy_gradients() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut rt = Runtime::cpu();
    let x = rt.tensor("x", Shape::new(4, 3), &random(&mut rng, 12)).unwrap();
    let w = rt.parameter("w", Shape::new(3, 5), &random(&mut rng, 15)).unwrap();
    let b = rt.parameter("b", Shape::row(5), &random(&mut rng, 5)).unwrap();
    let mut labels = vec![0.0; 20];
    for (row, class) in [1, 4, 0, 2].into_iter().enumerate() {
        labels[row * 5 + class] = 1.0;
    }
    let labels = rt.tensor("labels", Shape::new(4, 5), &labels).unwrap();

    check_gradients(&mut rt, &[w, b], &|rt| {
        let h = rt.matmul(x, w, None)?;
        let z = rt.bias_add(h, b, None)?;
        rt.cross_entropy(z, labels, None)
    });

    assert!(matches!(rt.gradient(labels), Err(Error::MissingGradient(_))));
    assert!(matches!(rt.gradient(x), Err(Error::MissingGradient(_))));
}

#[test]
fn test_diamond_accumulates() {
    let mut rt = Runtime::cpu();
    let x = rt.parameter("x", Shape::row(3), &[-1.0, 2.0, 3.0]).unwrap();
    let left = rt.relu(x, None).unwrap();
    let right = rt.add(x, x, None).unwrap();
    let y = rt.add(left, right, None).unwrap();
    rt.backward(y).unwrap();

    let grad = rt.gradient(x).unwrap();
    assert_eq!(rt.read_tensor(grad).unwrap(), vec![2.0, 3.0, 3.0]);
}

#[test]
fn test_graph_records_only_differentiable_paths() {
    let mut rt = Runtime::cpu();
    let x = rt.tensor("x", Shape::row(2), &[1.0, 2.0]).unwrap();
    let w = rt.parameter("w", Shape::row(2), &[3.0, 4.0]).unwrap();

    let constant = rt.relu(x, None).unwrap();
    assert!(!rt.requires_grad(constant).unwrap());
    assert!(rt.record(constant).unwrap().grad_fn().is_none());

    let y = rt.add(x, w, None).unwrap();
    assert!(rt.requires_grad(y).unwrap());
    assert_eq!(rt.record(y).unwrap().grad_fn(), Some(&GradFn::Add));
    assert_eq!(rt.record(y).unwrap().parents(), &[x, w]);

    let untracked = rt.no_grad(|rt| rt.add(x, w, None)).unwrap();
    assert!(!rt.requires_grad(untracked).unwrap());
    assert!(rt.is_grad_enabled());
}

#[test]
fn test_backward_is_repeatable() {
    let mut rt = Runtime::cpu();
    let w = rt.parameter("w", Shape::new(2, 1), &[0.5, -0.5]).unwrap();
    let x = rt.tensor("x", Shape::new(3, 2), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

    let mut grads = Vec::new();
    for _ in 0..3 {
        rt.begin_scope("fwd");
        let y = rt.matmul(x, w, None).unwrap();
        rt.backward(y).unwrap();
        let grad = rt.gradient(w).unwrap();
        grads.push(rt.read_tensor(grad).unwrap());
    }
    assert_eq!(grads[0], vec![9.0, 12.0]);
    assert!(grads.iter().all(|g| g == &grads[0]));
}

#[test]
fn test_dropout_gradient_is_the_mask() {
    let mut rt = Runtime::cpu();
    let x = rt.parameter("x", Shape::new(1, 4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let mask = rt.tensor("mask", Shape::new(1, 4), &[0.0, 2.0, 0.0, 2.0]).unwrap();
    let y = rt.dropout(x, mask, None).unwrap();
    assert_eq!(rt.read_tensor(y).unwrap(), vec![0.0, 4.0, 0.0, 8.0]);
    assert_eq!(rt.record(y).unwrap().grad_fn(), Some(&GradFn::Dropout { mask }));

    rt.backward(y).unwrap();
    let grad = rt.gradient(x).unwrap();
    assert_eq!(rt.read_tensor(grad).unwrap(), vec![0.0, 2.0, 0.0, 2.0]);
    assert_eq!(rt.try_gradient(mask).unwrap(), None);
}

#[test]
fn test_dropout_layer_backpropagates_through_its_mask() {
    use gpugrad::nn::{Dropout, Layer};

    let mut rt = Runtime::cpu();
    let x = rt.parameter("x", Shape::new(4, 8), &[1.0; 32]).unwrap();
    let mut dropout = Dropout::with_seed(0.5, 9).unwrap();

    rt.begin_scope("fwd");
    let y = dropout.forward(&mut rt, x, true).unwrap();
    let kept = rt.read_tensor(y).unwrap();
    rt.backward(y).unwrap();

    let grad = rt.gradient(x).unwrap();
    assert_eq!(rt.read_tensor(grad).unwrap(), kept);
}
