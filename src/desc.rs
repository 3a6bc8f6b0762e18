//! Tensor and device-memory descriptors, and the layout algebra that
//! connects them.
//!
//! A [`TensorDescriptor`] is the immutable logical description of an
//! N-dimensional array: element datatype, layout family, and up to four
//! extents. A [`MemoryDescriptor`] is the backend-specific physical
//! description of the buffer that holds it: strides, offsets, byte size,
//! storage class and device packing. Memory descriptors are owned by the
//! tensor they describe and are recomputed whenever the layout changes.
//!
//! Two layout families are supported:
//!
//! - **spatial** (`Nchw`): batch / channel / height / width, used by vision
//!   models;
//! - **sequence-packed** (`Mkt`): batch·sequence / feature / time, used by
//!   language models.
//!
//! The GPU backend packs both into a channel-vectorized form where channels
//! are grouped four at a time ([`DeviceFormat::ChanVec4`]).

use crate::error::Error;

/// Element datatypes carried by tensors.
///
/// Only `F32` has kernels on every backend; the rest exist so that model
/// metadata can be represented and rejected with
/// [`Error::UnsupportedDatatype`](crate::error::Error::UnsupportedDatatype)
/// instead of silently producing wrong results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 16-bit IEEE float.
    F16,
    /// 32-bit IEEE float.
    F32,
    /// 8-bit signed integer.
    I8,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::F16 => 2,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::I8 => 1,
        }
    }
}

/// Logical layout family of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// Row-major spatial layout: batch, channel, height, width.
    Nchw,
    /// Sequence-packed layout: batch·sequence (m), feature (k), time (t).
    Mkt,
    /// Channel-vectorized packing, channels grouped four at a time.
    ChanVec4,
}

/// Immutable shape/datatype/layout value describing an N-dimensional array.
///
/// Produced by shape inference, consumed everywhere. Descriptors are plain
/// values; copying one never aliases storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorDescriptor {
    dt: DataType,
    layout: TensorLayout,
    dims: [usize; 4],
    ndims: usize,
}

impl TensorDescriptor {
    /// A 4-D spatial descriptor.
    pub fn nchw(dt: DataType, n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { dt, layout: TensorLayout::Nchw, dims: [n, c, h, w], ndims: 4 }
    }

    /// A 3-D sequence-packed descriptor.
    pub fn mkt(dt: DataType, m: usize, k: usize, t: usize) -> Self {
        Self { dt, layout: TensorLayout::Mkt, dims: [m, k, t, 1], ndims: 3 }
    }

    /// Element datatype.
    pub fn dt(&self) -> DataType {
        self.dt
    }

    /// Layout family tag.
    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.ndims
    }

    /// All extents, outermost first.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.ndims]
    }

    /// Batch extent of a spatial descriptor.
    pub fn batch(&self) -> usize {
        self.dims[0]
    }

    /// Channel extent of a spatial descriptor, feature extent of a
    /// sequence-packed one.
    pub fn channels(&self) -> usize {
        self.dims[1]
    }

    /// Height extent of a spatial descriptor.
    pub fn height(&self) -> usize {
        self.dims[2]
    }

    /// Width extent of a spatial descriptor.
    pub fn width(&self) -> usize {
        self.dims[3]
    }

    /// `(m, k, t)` extents of a sequence-packed descriptor.
    pub fn mkt_dims(&self) -> (usize, usize, usize) {
        (self.dims[0], self.dims[1], self.dims[2])
    }

    /// Same descriptor with the channel/feature extent replaced.
    ///
    /// Used to derive an operator's output descriptor from its input.
    pub fn with_channels(mut self, c: usize) -> Self {
        self.dims[1] = c;
        self
    }

    /// Total element count.
    pub fn num_elements(&self) -> usize {
        self.dims().iter().product()
    }

    /// Total unpadded byte count.
    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.dt.size()
    }
}

/// Storage class of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Plain linear buffer.
    Buffer,
    /// 1-D image.
    Image1d,
    /// 2-D image.
    Image2d,
}

/// Device-side packing of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFormat {
    /// Densely packed in logical order.
    Linear,
    /// Channel-vectorized: channels grouped four at a time, each group a
    /// contiguous lane of four elements.
    ChanVec4,
    /// Transposed, vectorized weight packing for fully-connected filters.
    WeightVec4,
}

/// Backend-specific buffer layout derived from a [`TensorDescriptor`] plus a
/// target packing scheme.
///
/// Owned by the tensor it describes; never aliases another tensor's
/// descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDescriptor {
    /// Extent of each packed axis.
    pub stride: [usize; 3],
    /// Start offset along each packed axis.
    pub offset: [usize; 3],
    /// Total allocation size in bytes, padding included.
    pub byte_size: usize,
    /// Storage class the backend should allocate.
    pub storage: StorageClass,
    /// Device-side packing.
    pub format: DeviceFormat,
    /// Element datatype.
    pub dt: DataType,
    /// True when the allocation is larger than the natural extent and the
    /// execution layer must zero-fill the pad region before computing.
    pub need_pad: bool,
}

impl MemoryDescriptor {
    /// A linear buffer of `elems` densely packed elements.
    pub fn linear(dt: DataType, elems: usize) -> Self {
        Self {
            stride: [elems, 1, 1],
            offset: [0, 0, 0],
            byte_size: elems * dt.size(),
            storage: StorageClass::Buffer,
            format: DeviceFormat::Linear,
            dt,
            need_pad: false,
        }
    }

    /// A channel-vectorized buffer of `w × h × groups` lanes of four.
    pub fn chan_vec4(dt: DataType, w: usize, h: usize, groups: usize, need_pad: bool) -> Self {
        Self {
            stride: [w, h, groups],
            offset: [0, 0, 0],
            byte_size: w * h * groups * 4 * dt.size(),
            storage: StorageClass::Buffer,
            format: DeviceFormat::ChanVec4,
            dt,
            need_pad,
        }
    }

    /// A 1-D image of `len` four-element texels (used for bias vectors).
    pub fn image1d(dt: DataType, len: usize) -> Self {
        Self {
            stride: [len, 1, 1],
            offset: [0, 0, 0],
            byte_size: len * 4 * dt.size(),
            storage: StorageClass::Image1d,
            format: DeviceFormat::ChanVec4,
            dt,
            need_pad: false,
        }
    }

    /// Element capacity of the allocation, padding included.
    pub fn num_elements(&self) -> usize {
        self.byte_size / self.dt.size()
    }
}

/// `x` rounded up to the next multiple of `a`. `a == 0` leaves `x` unchanged.
pub fn align_up(x: usize, a: usize) -> usize {
    if a == 0 { x } else { x.div_ceil(a) * a }
}

/// Channel-vectorized extents for a spatial tensor: `(w, h, groups)`.
pub fn nchw_to_chanvec4(c: usize, h: usize, w: usize) -> (usize, usize, usize) {
    (w, h, c.div_ceil(4))
}

/// Channel-vectorized extents for a sequence-packed tensor: `(w, h, groups)`.
///
/// The batch·sequence axis maps to width, time to height, and features are
/// grouped four at a time.
pub fn mkt_to_chanvec4(m: usize, k: usize, t: usize) -> (usize, usize, usize) {
    (m, t, k.div_ceil(4))
}

/// Padded time extent for a sequence-packed input.
///
/// The time axis is grown so the buffer is large enough for any tile width a
/// later autotuning pass might pick: the maximum over all candidate tile
/// widths of `t` aligned up to that width.
pub fn padded_time_extent(t: usize, tile_widths: impl IntoIterator<Item = u32>) -> usize {
    let mut t_align = t;
    for w in tile_widths {
        let j = align_up(t, w as usize);
        if j > t_align {
            t_align = j;
        }
    }
    t_align
}

/// Output spatial extent for a windowed operator.
///
/// `round((input + pad_lo + pad_hi - kernel) / stride) + 1`, where the
/// rounding direction is chosen by the pooling parameter's rounding mode.
/// Fails with [`Error::ShapeMismatch`] when the kernel does not fit in the
/// padded input, and with [`Error::ShapeMismatch`] on a zero stride.
pub fn windowed_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    pad_lo: usize,
    pad_hi: usize,
    ceil_mode: bool,
) -> Result<usize, Error> {
    let padded = input + pad_lo + pad_hi;
    if stride == 0 || kernel == 0 || padded < kernel {
        return Err(Error::ShapeMismatch);
    }
    let span = padded - kernel;
    let steps = if ceil_mode { span.div_ceil(stride) } else { span / stride };
    Ok(steps + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(10, 4), 12);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up(0, 8), 0);
    }

    #[test]
    fn chanvec4_allocation_covers_ragged_channels() {
        let mem = MemoryDescriptor::chan_vec4(DataType::F32, 3, 5, 7usize.div_ceil(4), false);
        // 7 channels round up to two groups of four.
        assert_eq!(mem.stride, [3, 5, 2]);
        assert_eq!(mem.byte_size, 3 * 5 * 2 * 4 * 4);
        assert!(!mem.need_pad);
    }

    #[test]
    fn padded_time_covers_every_tile_width() {
        // Tile widths 1..=8: t=10 aligns to 16 for width 8, the maximum.
        let t_align = padded_time_extent(10, 1..=8u32);
        assert_eq!(t_align, 16);
        for w in 1..=8usize {
            assert!(align_up(10, w) <= t_align);
        }
        // Already aligned input needs no padding.
        assert_eq!(padded_time_extent(8, [4u32, 8]), 8);
    }

    #[test]
    fn windowed_extent_rejects_oversized_kernel() {
        assert_eq!(windowed_extent(3, 5, 1, 0, 0, false), Err(Error::ShapeMismatch));
        assert_eq!(windowed_extent(3, 5, 1, 1, 1, false), Ok(1));
    }

    #[test]
    fn descriptor_accessors() {
        let d = TensorDescriptor::nchw(DataType::F32, 1, 16, 5, 7);
        assert_eq!(d.rank(), 4);
        assert_eq!((d.batch(), d.channels(), d.height(), d.width()), (1, 16, 5, 7));
        assert_eq!(d.num_bytes(), 16 * 5 * 7 * 4);

        let m = TensorDescriptor::mkt(DataType::F32, 2, 64, 9);
        assert_eq!(m.rank(), 3);
        assert_eq!(m.mkt_dims(), (2, 64, 9));
        assert_eq!(m.with_channels(128).mkt_dims(), (2, 128, 9));
    }
}
