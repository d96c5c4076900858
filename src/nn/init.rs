//! Weight initializers.

use rand::Rng;

/// Standard normal samples via the Box-Muller transform.
pub fn randn<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<f32> {
    (0..len)
        .map(|_| {
            // 1 - u keeps the log argument in (0, 1]
            let u1 = 1.0 - rng.random::<f32>();
            let u2 = rng.random::<f32>();
            (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
        })
        .collect()
}

/// He normal: `N(0, 2 / fan_in)`.
pub fn he_normal<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, len: usize) -> Vec<f32> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    randn(rng, len).into_iter().map(|v| v * std).collect()
}

/// He uniform: `U(-sqrt(6 / fan_in), sqrt(6 / fan_in))`.
pub fn he_uniform<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, len: usize) -> Vec<f32> {
    let limit = (6.0 / fan_in.max(1) as f32).sqrt();
    (0..len).map(|_| rng.random_range(-limit..limit)).collect()
}
