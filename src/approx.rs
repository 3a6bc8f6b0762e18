//! Utilities to approximate equality of floating point values.

/// The max absolute error accepted when comparing kernel outputs.
pub const F32_MAX_ERROR: f32 = 1e-4;

/// Checks absolute distance against [`F32_MAX_ERROR`].
pub fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < F32_MAX_ERROR
}

/// Element-wise [`approx_eq`] over two slices of equal length.
pub fn approx_eq_slice(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| approx_eq(x, y))
}
