//! Pooling kernels for the CPU backend.

use rayon::prelude::*;

use crate::desc::TensorDescriptor;
use crate::error::Error;
use crate::ops::pooling::{PoolingMode, PoolingParams};

/// Reduces one output window. Returns the window maximum or the mean over
/// in-bounds elements; a window that covers only padding yields zero.
fn reduce_window(
    plane: &[f32],
    ih: usize,
    iw: usize,
    oy: usize,
    ox: usize,
    p: &PoolingParams,
) -> f32 {
    let (kh, kw) = p.kernel;
    let (sh, sw) = p.stride;
    let (pt, _, pl, _) = p.padding;
    let y0 = (oy * sh) as isize - pt as isize;
    let x0 = (ox * sw) as isize - pl as isize;
    let mut acc = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for dy in 0..kh {
        let y = y0 + dy as isize;
        if y < 0 || y >= ih as isize {
            continue;
        }
        for dx in 0..kw {
            let x = x0 + dx as isize;
            if x < 0 || x >= iw as isize {
                continue;
            }
            let v = plane[y as usize * iw + x as usize];
            acc = acc.max(v);
            sum += v;
            count += 1;
        }
    }
    match p.mode {
        PoolingMode::Max => {
            if count == 0 {
                0.0
            } else {
                acc
            }
        }
        PoolingMode::Mean => {
            if count == 0 {
                0.0
            } else {
                sum / count as f32
            }
        }
    }
}

fn output_extents(input: &TensorDescriptor, output_len: usize) -> (usize, usize) {
    let planes = input.batch() * input.channels();
    (planes, output_len / planes.max(1))
}

/// Scalar reference pooling over a plain NCHW tensor.
pub fn pooling_general(
    input_desc: &TensorDescriptor,
    input: &[f32],
    p: &PoolingParams,
    output: &mut [f32],
) -> Result<(), Error> {
    run(input_desc, input, p, output, false)
}

/// Parallel pooling: one rayon task per channel plane.
pub fn pooling_simd(
    input_desc: &TensorDescriptor,
    input: &[f32],
    p: &PoolingParams,
    output: &mut [f32],
) -> Result<(), Error> {
    run(input_desc, input, p, output, true)
}

fn run(
    input_desc: &TensorDescriptor,
    input: &[f32],
    p: &PoolingParams,
    output: &mut [f32],
    parallel: bool,
) -> Result<(), Error> {
    let (ih, iw) = (input_desc.height(), input_desc.width());
    let (planes, out_plane) = output_extents(input_desc, output.len());
    if planes == 0 || out_plane == 0 {
        return Err(Error::ShapeMismatch);
    }
    // Recover the output width from the window math so the flat plane can be
    // addressed 2-D.
    let p_res = p.resolved(input_desc)?;
    let ow = crate::desc::windowed_extent(
        iw,
        p_res.kernel.1,
        p_res.stride.1,
        p_res.padding.2,
        p_res.padding.3,
        matches!(p_res.rounding, crate::ops::pooling::RoundingMode::Ceil),
    )?;
    let oh = out_plane / ow;
    if oh * ow != out_plane || input.len() != planes * ih * iw {
        return Err(Error::ShapeMismatch);
    }

    if parallel {
        output
            .par_chunks_mut(out_plane)
            .zip(input.par_chunks(ih * iw))
            .for_each(|(po, pi)| pool_plane(po, pi, oh, ow, ih, iw, &p_res));
    } else {
        output
            .chunks_mut(out_plane)
            .zip(input.chunks(ih * iw))
            .for_each(|(po, pi)| pool_plane(po, pi, oh, ow, ih, iw, &p_res));
    }
    Ok(())
}

fn pool_plane(
    plane_out: &mut [f32],
    plane_in: &[f32],
    oh: usize,
    ow: usize,
    ih: usize,
    iw: usize,
    p: &PoolingParams,
) {
    for oy in 0..oh {
        for ox in 0..ow {
            plane_out[oy * ow + ox] = reduce_window(plane_in, ih, iw, oy, ox, p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::DataType;
    use crate::ops::pooling::RoundingMode;

    fn max_params(kernel: (usize, usize), stride: (usize, usize)) -> PoolingParams {
        PoolingParams {
            mode: PoolingMode::Max,
            kernel,
            stride,
            padding: (0, 0, 0, 0),
            rounding: RoundingMode::Floor,
        }
    }

    #[test]
    fn max_pool_2x2() {
        let desc = TensorDescriptor::nchw(DataType::F32, 1, 1, 4, 4);
        let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        let mut out = vec![0.0; 4];
        pooling_general(&desc, &input, &max_params((2, 2), (2, 2)), &mut out).unwrap();
        assert_eq!(out, vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn mean_pool_counts_only_in_bounds() {
        let desc = TensorDescriptor::nchw(DataType::F32, 1, 1, 2, 2);
        let input = vec![2.0, 4.0, 6.0, 8.0];
        let p = PoolingParams {
            mode: PoolingMode::Mean,
            kernel: (2, 2),
            stride: (2, 2),
            padding: (1, 0, 1, 0),
            rounding: RoundingMode::Ceil,
        };
        let mut out = vec![0.0; 4];
        pooling_general(&desc, &input, &p, &mut out).unwrap();
        // Top-left window covers only element (0,0); bottom-right covers all
        // four minus the padded row/column it started past.
        assert_eq!(out[0], 2.0);
        assert_eq!(out[3], 8.0);
    }

    #[test]
    fn parallel_matches_scalar() {
        let desc = TensorDescriptor::nchw(DataType::F32, 1, 3, 5, 5);
        let input: Vec<f32> = (0..75).map(|v| (v % 13) as f32).collect();
        let p = max_params((3, 3), (2, 2));
        let mut a = vec![0.0; 3 * 2 * 2];
        let mut b = vec![0.0; 3 * 2 * 2];
        pooling_general(&desc, &input, &p, &mut a).unwrap();
        pooling_simd(&desc, &input, &p, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn global_pooling_reduces_whole_plane() {
        let desc = TensorDescriptor::nchw(DataType::F32, 1, 2, 2, 3);
        let input = vec![1.0, 5.0, 3.0, 2.0, 4.0, 0.0, -1.0, -5.0, -3.0, -2.0, -4.0, 0.0];
        let p = max_params((0, 0), (1, 1));
        let mut out = vec![0.0; 2];
        pooling_general(&desc, &input, &p, &mut out).unwrap();
        assert_eq!(out, vec![5.0, 0.0]);
    }
}
