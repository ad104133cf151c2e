//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

/// Apply polynomial coefficients to a value.
///
/// Coefficients are ordered highest power first, i.e. `[c0, c1, c2]` is
/// `c0*x^2 + c1*x + c2`.
pub fn poly_val<T>(value: &T, coeffs: &[T]) -> T
where
    T: Float + std::ops::AddAssign
{
    // Horner's method
    let mut res = T::zero();

    for c in coeffs.iter() {
        res = res * *value + *c;
    }

    res
}

/// Get the coefficients of the derivative of a polynomial.
///
/// Uses the same highest-power-first ordering as `poly_val`. The derivative of
/// a constant is the empty polynomial, which `poly_val` evaluates to zero.
pub fn poly_deriv<T>(coeffs: &[T]) -> Vec<T>
where
    T: Float
{
    let order = coeffs.len().saturating_sub(1);

    coeffs.iter()
        .take(order)
        .enumerate()
        .map(|(i, c)| *c * T::from(order - i).unwrap_or_else(T::zero))
        .collect()
}

pub fn clamp<T>(value: &T, min: &T, max: &T) -> T 
where
    T: Float
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Calculates the least nonnegative remainder of `lhs (mod rhs)`.
/// 
/// This function is taken from the std library as num is missing it.
///
/// In particular, the return value `r` satisfies `0.0 <= r < rhs.abs()` in
/// most cases. However, due to a floating point round-off error it can
/// result in `r == rhs.abs()`.
pub fn rem_euclid<T>(lhs: T, rhs: T) -> T
where
    T: Float
{
    let r = lhs % rhs;
    if r < T::zero() { r + rhs.abs() } else { r }
}

/// Wrap an angle into the range [-pi, pi).
///
/// Angles already in range are returned unchanged.
pub fn wrap_pi<T>(value: T) -> T
where
    T: Float
{
    let pi_t = T::from(std::f64::consts::PI).unwrap_or_else(T::zero);
    let tau_t = pi_t + pi_t;

    if value >= -pi_t && value < pi_t {
        return value
    }

    rem_euclid(value + pi_t, tau_t) - pi_t
}

/// Unwrap `angle` so that it is the closest equivalent angle to `reference`.
pub fn unwrap_near<T>(angle: T, reference: T) -> T
where
    T: Float
{
    reference + wrap_pi(angle - reference)
}
