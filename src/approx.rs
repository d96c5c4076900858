//! Graded approximate equality for `f32` kernel outputs.

/// Largest difference still considered related.
pub const MAX_ERROR: f32 = 1e-3;

/// Typical difference between a device kernel and its host reference.
pub const AVG_ERROR: f32 = 1e-5;

/// Difference below which two values are treated as identical.
pub const MIN_ERROR: f32 = 1e-6;

/// Closeness of two values, from best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`MIN_ERROR`].
    Precise = 0,

    /// Within [`AVG_ERROR`].
    Partial = 1,

    /// Within [`MAX_ERROR`].
    Relative = 2,

    /// Not equal, or the operands differ in length.
    Scarce = 3,
}

/// Compares against a value of type `Rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<f32> for f32 {
    fn approx_eq(&self, rhs: &f32) -> ApproxEquality {
        let dif = (self - rhs).abs();
        if dif < MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl<T: RelativeEq<T>> RelativeEq<[T]> for [T] {
    /// The worst grade over all element pairs.
    fn approx_eq(&self, rhs: &[T]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (lhs, rhs) in self.iter().zip(rhs) {
            eq = eq.max(lhs.approx_eq(rhs));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

impl<const N: usize, T: RelativeEq<T>> RelativeEq<[T; N]> for [T; N] {
    fn approx_eq(&self, rhs: &[T; N]) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

impl<const N: usize, T: RelativeEq<T>> RelativeEq<[T; N]> for Vec<T> {
    fn approx_eq(&self, rhs: &[T; N]) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

impl<T: RelativeEq<T>> RelativeEq<Vec<T>> for Vec<T> {
    fn approx_eq(&self, rhs: &Vec<T>) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

/// True when `a` and `b` are at worst [`ApproxEquality::Relative`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) != ApproxEquality::Scarce
}
