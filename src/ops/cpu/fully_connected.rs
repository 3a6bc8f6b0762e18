//! Fully-connected kernels for the CPU backend.
//!
//! One slice at a time: the operator loops over output slices and calls
//! these with the slice's filter, bias and output. Spatial inputs are
//! flattened to a single feature vector per batch; sequence-packed inputs
//! apply the filter independently at every (batch·sequence, time) position.

use rayon::prelude::*;

use crate::desc::{TensorDescriptor, TensorLayout};
use crate::error::Error;

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
use core::arch::x86_64::*;

/// Dot product of two equal-length slices.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

/// Vectorized dot product. Falls back to the scalar loop off AVX2 targets.
fn dot_fast(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
    {
        const LANES: usize = 8;
        let mut sum = 0.0f32;
        let chunks = a.len() / LANES;
        unsafe {
            let mut acc = _mm256_setzero_ps();
            for i in 0..chunks {
                let x = _mm256_loadu_ps(a.as_ptr().add(i * LANES));
                let y = _mm256_loadu_ps(b.as_ptr().add(i * LANES));
                acc = _mm256_add_ps(acc, _mm256_mul_ps(x, y));
            }
            let mut lanes = [0.0f32; LANES];
            _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
            sum += lanes.iter().sum::<f32>();
        }
        sum += dot(&a[chunks * LANES..], &b[chunks * LANES..]);
        sum
    }
    #[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
    {
        dot(a, b)
    }
}

fn check(
    input_desc: &TensorDescriptor,
    input: &[f32],
    filter_desc: &TensorDescriptor,
    filter: &[f32],
    output: &[f32],
) -> Result<(usize, usize), Error> {
    let n_out = filter_desc.batch();
    let reduce = filter_desc.channels() * filter_desc.height() * filter_desc.width();
    if filter.len() != n_out * reduce {
        return Err(Error::ShapeMismatch);
    }
    match input_desc.layout() {
        TensorLayout::Nchw => {
            let feats = input_desc.channels() * input_desc.height() * input_desc.width();
            if feats != reduce
                || input.len() != input_desc.batch() * feats
                || output.len() != input_desc.batch() * n_out
            {
                return Err(Error::ShapeMismatch);
            }
        }
        TensorLayout::Mkt => {
            let (m, k, t) = input_desc.mkt_dims();
            if filter_desc.height() != 1 || filter_desc.width() != 1 {
                return Err(Error::ShapeMismatch);
            }
            if k != reduce || input.len() != m * k * t || output.len() != m * n_out * t {
                return Err(Error::ShapeMismatch);
            }
        }
        TensorLayout::ChanVec4 => return Err(Error::UnsupportedLayout),
    }
    Ok((n_out, reduce))
}

/// Scalar reference fully-connected.
pub fn fully_connected_general(
    input_desc: &TensorDescriptor,
    input: &[f32],
    filter_desc: &TensorDescriptor,
    filter: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
) -> Result<(), Error> {
    run(input_desc, input, filter_desc, filter, bias, output, false)
}

/// Parallel/vectorized fully-connected: rayon over output rows, vectorized
/// inner dot product.
pub fn fully_connected_simd(
    input_desc: &TensorDescriptor,
    input: &[f32],
    filter_desc: &TensorDescriptor,
    filter: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
) -> Result<(), Error> {
    run(input_desc, input, filter_desc, filter, bias, output, true)
}

#[allow(clippy::too_many_arguments)]
fn run(
    input_desc: &TensorDescriptor,
    input: &[f32],
    filter_desc: &TensorDescriptor,
    filter: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    parallel: bool,
) -> Result<(), Error> {
    let (n_out, reduce) = check(input_desc, input, filter_desc, filter, output)?;
    if let Some(b) = bias {
        if b.len() != n_out {
            return Err(Error::ShapeMismatch);
        }
    }
    match input_desc.layout() {
        TensorLayout::Nchw => {
            if parallel {
                output.par_chunks_mut(n_out).enumerate().for_each(|(bi, row)| {
                    batch_row(row, bi, input, filter, bias, reduce, true);
                });
            } else {
                output.chunks_mut(n_out).enumerate().for_each(|(bi, row)| {
                    batch_row(row, bi, input, filter, bias, reduce, false);
                });
            }
        }
        TensorLayout::Mkt => {
            let (_, k, t) = input_desc.mkt_dims();
            if parallel {
                output.par_chunks_mut(t).enumerate().for_each(|(row, out_row)| {
                    time_row(out_row, row, input, filter, bias, n_out, k, t);
                });
            } else {
                output.chunks_mut(t).enumerate().for_each(|(row, out_row)| {
                    time_row(out_row, row, input, filter, bias, n_out, k, t);
                });
            }
        }
        TensorLayout::ChanVec4 => return Err(Error::UnsupportedLayout),
    }
    Ok(())
}

/// One batch's output row for the spatial path: a flattened GEMV.
fn batch_row(
    out_row: &mut [f32],
    bi: usize,
    input: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
    reduce: usize,
    fast: bool,
) {
    let x = &input[bi * reduce..(bi + 1) * reduce];
    for (f, out) in out_row.iter_mut().enumerate() {
        let w = &filter[f * reduce..(f + 1) * reduce];
        let acc = if fast { dot_fast(x, w) } else { dot(x, w) };
        *out = acc + bias.map_or(0.0, |b| b[f]);
    }
}

/// One (batch·sequence, feature) output row for the sequence-packed path.
/// Input rows are (m, k) pairs of length t, so the reduction walks k rows
/// with stride t.
#[allow(clippy::too_many_arguments)]
fn time_row(
    out_row: &mut [f32],
    row: usize,
    input: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
    n_out: usize,
    k: usize,
    t: usize,
) {
    let (mi, f) = (row / n_out, row % n_out);
    let w = &filter[f * k..(f + 1) * k];
    let x = &input[mi * k * t..(mi + 1) * k * t];
    for (ti, out) in out_row.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (ki, &wv) in w.iter().enumerate() {
            acc += wv * x[ki * t + ti];
        }
        *out = acc + bias.map_or(0.0, |b| b[f]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq_slice;
    use crate::desc::DataType;
    use rand::Rng;

    #[test]
    fn spatial_fc_is_a_flattened_gemv() {
        let input_desc = TensorDescriptor::nchw(DataType::F32, 1, 2, 1, 2);
        let filter_desc = TensorDescriptor::nchw(DataType::F32, 3, 2, 1, 2);
        let input = vec![1.0, 2.0, 3.0, 4.0];
        #[rustfmt::skip]
        let filter = vec![
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            1.0, 1.0, 1.0, 1.0,
        ];
        let bias = vec![0.5, 0.0, -1.0];
        let mut out = vec![0.0; 3];
        fully_connected_general(&input_desc, &input, &filter_desc, &filter, Some(&bias), &mut out)
            .unwrap();
        assert_eq!(out, vec![1.5, 6.0, 9.0]);
    }

    #[test]
    fn mkt_fc_applies_filter_per_time_step() {
        let input_desc = TensorDescriptor::mkt(DataType::F32, 1, 2, 3);
        let filter_desc = TensorDescriptor::nchw(DataType::F32, 2, 2, 1, 1);
        // k=2 features over t=3 steps: feature 0 = [1,2,3], feature 1 = [10,20,30]
        let input = vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let filter = vec![1.0, 1.0, 2.0, 0.0];
        let mut out = vec![0.0; 6];
        fully_connected_general(&input_desc, &input, &filter_desc, &filter, None, &mut out)
            .unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn filter_channel_mismatch_is_rejected() {
        let input_desc = TensorDescriptor::nchw(DataType::F32, 1, 3, 1, 1);
        let filter_desc = TensorDescriptor::nchw(DataType::F32, 2, 4, 1, 1);
        let input = vec![0.0; 3];
        let filter = vec![0.0; 8];
        let mut out = vec![0.0; 2];
        let err =
            fully_connected_general(&input_desc, &input, &filter_desc, &filter, None, &mut out)
                .unwrap_err();
        assert_eq!(err, Error::ShapeMismatch);
    }

    #[test]
    fn simd_matches_general() {
        let mut rng = rand::rng();
        let input_desc = TensorDescriptor::nchw(DataType::F32, 1, 16, 3, 3);
        let filter_desc = TensorDescriptor::nchw(DataType::F32, 24, 16, 3, 3);
        let input: Vec<f32> = (0..16 * 9).map(|_| rng.random_range(-1.0..1.0)).collect();
        let filter: Vec<f32> = (0..24 * 16 * 9).map(|_| rng.random_range(-1.0..1.0)).collect();
        let bias: Vec<f32> = (0..24).map(|_| rng.random_range(-1.0..1.0)).collect();
        let mut a = vec![0.0; 24];
        let mut b = vec![0.0; 24];
        fully_connected_general(&input_desc, &input, &filter_desc, &filter, Some(&bias), &mut a)
            .unwrap();
        fully_connected_simd(&input_desc, &input, &filter_desc, &filter, Some(&bias), &mut b)
            .unwrap();
        assert!(approx_eq_slice(&a, &b));
    }
}
