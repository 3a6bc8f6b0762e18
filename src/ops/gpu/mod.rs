//! GPU backend: layout packing, candidate generation, autotuning, and
//! kernel dispatch.
//!
//! Device buffers use a channel-vectorized packing: channels are grouped
//! four at a time and each group is a contiguous lane of four elements, so
//! one texel-sized read feeds a four-wide vector op. The packing functions
//! here convert between the host's logical order and that device order, and
//! zero-fill any pad region a memory descriptor declares.

pub mod candidates;
pub mod fully_connected;
pub mod pooling;
pub mod tuning;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::desc::{DataType, MemoryDescriptor, TensorDescriptor, align_up};
use crate::device::BufferId;
use crate::error::Error;
use crate::tensor::Tensor;

use candidates::KernelConfiguration;

/// Borrowed view of a device-resident operand: logical descriptor, buffer
/// layout, and (possibly absent) allocation.
pub struct DeviceTensor<'a> {
    /// Logical descriptor.
    pub desc: &'a TensorDescriptor,
    /// Buffer layout the allocation satisfies.
    pub mem: &'a MemoryDescriptor,
    /// The allocation itself; `None` is rejected by operand validation.
    pub buf: Option<BufferId>,
}

impl<'a> DeviceTensor<'a> {
    /// Views a host tensor's device mirror. Fails with
    /// [`Error::NullArgument`] when no memory descriptor has been inferred
    /// for it yet.
    pub fn of(t: &'a Tensor) -> Result<Self, Error> {
        let mem = t.device_mem().ok_or(Error::NullArgument)?;
        Ok(Self { desc: t.desc(), mem, buf: t.device_buf() })
    }
}

/// Flat index of `(group, y, x, lane)` in a channel-vectorized buffer of
/// extents `(w, h)`.
fn vec4_index(w: usize, h: usize, group: usize, y: usize, x: usize, lane: usize) -> usize {
    ((group * h + y) * w + x) * 4 + lane
}

/// Packs a single-batch spatial tensor into channel-vectorized device order.
pub fn pack_nchw(desc: &TensorDescriptor, mem: &MemoryDescriptor, data: &[f32]) -> Vec<f32> {
    let (c, h, w) = (desc.channels(), desc.height(), desc.width());
    let mut out = vec![0.0f32; mem.num_elements()];
    for ci in 0..c {
        for y in 0..h {
            for x in 0..w {
                out[vec4_index(w, h, ci / 4, y, x, ci % 4)] = data[(ci * h + y) * w + x];
            }
        }
    }
    out
}

/// Unpacks a channel-vectorized buffer back into logical spatial order.
pub fn unpack_nchw(desc: &TensorDescriptor, packed: &[f32], out: &mut [f32]) {
    let (c, h, w) = (desc.channels(), desc.height(), desc.width());
    for ci in 0..c {
        for y in 0..h {
            for x in 0..w {
                out[(ci * h + y) * w + x] = packed[vec4_index(w, h, ci / 4, y, x, ci % 4)];
            }
        }
    }
}

/// Packs a sequence-packed tensor into channel-vectorized device order.
///
/// The buffer's time extent (`mem.stride[1]`) may exceed the tensor's
/// natural extent; the pad region is written as zeros, which the kernels
/// then ignore.
pub fn pack_mkt(desc: &TensorDescriptor, mem: &MemoryDescriptor, data: &[f32]) -> Vec<f32> {
    let (m, k, t) = desc.mkt_dims();
    let t_stride = mem.stride[1];
    let mut out = vec![0.0f32; mem.num_elements()];
    for mi in 0..m {
        for ki in 0..k {
            for ti in 0..t {
                out[vec4_index(m, t_stride, ki / 4, ti, mi, ki % 4)] =
                    data[(mi * k + ki) * t + ti];
            }
        }
    }
    out
}

/// Unpacks a channel-vectorized buffer back into logical sequence-packed
/// order, skipping any pad region.
pub fn unpack_mkt(desc: &TensorDescriptor, mem: &MemoryDescriptor, packed: &[f32], out: &mut [f32]) {
    let (m, k, t) = desc.mkt_dims();
    let t_stride = mem.stride[1];
    for mi in 0..m {
        for ki in 0..k {
            for ti in 0..t {
                out[(mi * k + ki) * t + ti] =
                    packed[vec4_index(m, t_stride, ki / 4, ti, mi, ki % 4)];
            }
        }
    }
}

/// Packs a fully-connected filter into the transposed, vectorized weight
/// layout a configuration requires. Padding lanes are zero so they
/// contribute nothing to the accumulation.
pub fn pack_filter(
    filter: &TensorDescriptor,
    data: &[f32],
    cfg: &KernelConfiguration,
) -> Vec<f32> {
    let (n, c, h, w) = (filter.batch(), filter.channels(), filter.height(), filter.width());
    let kk = cfg.vec_k.max(4) as usize;
    let cc = cfg.group_c.max(1) as usize;
    let padded_n = align_up(n, kk);
    let padded_c = align_up(c, cc);
    let hw = h * w;
    let mut out = vec![0.0f32; padded_n * padded_c * hw];
    for ni in 0..n {
        for ci in 0..c {
            for s in 0..hw {
                out[(ni * padded_c + ci) * hw + s] = data[(ni * c + ci) * hw + s];
            }
        }
    }
    out
}

/// Packs a bias vector into four-element texels, zero-padded to the group
/// boundary.
pub fn pack_bias(n: usize, data: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0f32; n.div_ceil(4) * 4];
    out[..n].copy_from_slice(&data[..n]);
    out
}

/// Decodes little-endian device bytes back into host floats.
pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Channel-vectorized memory descriptor for `c` channels over a `w × h`
/// plane.
pub fn chanvec4_mem(dt: DataType, w: usize, h: usize, c: usize, need_pad: bool) -> MemoryDescriptor {
    MemoryDescriptor::chan_vec4(dt, w, h, c.div_ceil(4), need_pad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkt_pack_zero_fills_pad_region() {
        let desc = TensorDescriptor::mkt(DataType::F32, 1, 4, 3);
        let mem = chanvec4_mem(DataType::F32, 1, 5, 4, true); // t padded 3 -> 5
        let data: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        let packed = pack_mkt(&desc, &mem, &data);
        assert_eq!(packed.len(), 1 * 5 * 1 * 4);
        // Pad rows (t = 3, 4) must be zero across all lanes.
        for ti in 3..5 {
            for lane in 0..4 {
                assert_eq!(packed[vec4_index(1, 5, 0, ti, 0, lane)], 0.0);
            }
        }
        let mut back = vec![0.0f32; 12];
        unpack_mkt(&desc, &mem, &packed, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn filter_pack_pads_channels_with_zeros() {
        let desc = TensorDescriptor::nchw(DataType::F32, 2, 3, 1, 1);
        let cfg = KernelConfiguration {
            algorithm: candidates::Algorithm::Direct,
            tile_w: 1,
            group_c: 4,
            vec_k: 4,
        };
        let packed = pack_filter(&desc, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &cfg);
        // n padded 2 -> 4, c padded 3 -> 4.
        assert_eq!(packed.len(), 4 * 4);
        assert_eq!(&packed[..4], &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(&packed[4..8], &[4.0, 5.0, 6.0, 0.0]);
        assert!(packed[8..].iter().all(|&v| v == 0.0));
    }
}
