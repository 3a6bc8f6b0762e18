//! Pooling on the GPU backend.
//!
//! Pooling has no tunable configuration space: one kernel per mode, so the
//! algorithm-selection phase is a no-op and only descriptor inference,
//! validation and dispatch live here.

use crate::desc::{DataType, MemoryDescriptor, TensorDescriptor, TensorLayout};
use crate::device::{Device, KernelLaunch};
use crate::error::Error;
use crate::ops::pooling::{PoolingMode, PoolingParams, output_desc};

use super::{DeviceTensor, chanvec4_mem};

/// Pipeline names of the pooling kernels.
pub(crate) const POOL_MAX_KERNEL: &str = "pooling_max";
pub(crate) const POOL_MEAN_KERNEL: &str = "pooling_mean";

/// Workgroup extents the kernels are compiled with.
const WG: [u32; 2] = [8, 8];

/// Infers the output descriptor and the input/output memory descriptors for
/// pooling on this backend.
pub fn infer_output_size(
    input: &TensorDescriptor,
    p: &PoolingParams,
) -> Result<(TensorDescriptor, MemoryDescriptor, MemoryDescriptor), Error> {
    let out = output_desc(input, p)?;
    let in_mem = chanvec4_mem(input.dt(), input.width(), input.height(), input.channels(), false);
    let out_mem = chanvec4_mem(out.dt(), out.width(), out.height(), out.channels(), false);
    Ok((out, in_mem, out_mem))
}

/// Scratch bytes for pooling on this backend: none, the kernels reduce in
/// registers.
pub fn infer_forward_tmp_bytes(_input: &TensorDescriptor) -> Result<usize, Error> {
    Ok(0)
}

/// Records the pooling kernel on the queue.
///
/// Validation runs strictly before any device work: operands must be
/// channel-vectorized, single-batch, and `f32`.
pub fn execute(
    dev: &mut dyn Device,
    input: &DeviceTensor<'_>,
    p: &PoolingParams,
    output: &DeviceTensor<'_>,
) -> Result<(), Error> {
    let in_buf = input.buf.ok_or(Error::NullArgument)?;
    let out_buf = output.buf.ok_or(Error::NullArgument)?;
    if input.desc.layout() != TensorLayout::Nchw {
        return Err(Error::UnsupportedLayout);
    }
    if input.mem.format != crate::desc::DeviceFormat::ChanVec4
        || output.mem.format != crate::desc::DeviceFormat::ChanVec4
    {
        return Err(Error::UnsupportedLayout);
    }
    if input.desc.batch() > 1 {
        return Err(Error::UnsupportedLayout);
    }
    if output.desc.channels() != input.desc.channels() {
        return Err(Error::ShapeMismatch);
    }
    match input.desc.dt() {
        DataType::F32 => {}
        _ => return Err(Error::UnsupportedDatatype),
    }

    let p = p.resolved(input.desc)?;
    let (kh, kw) = p.kernel;
    let (sh, sw) = p.stride;
    let (pt, _, pl, _) = p.padding;
    let (ow, oh) = (output.desc.width(), output.desc.height());
    let groups = input.desc.channels().div_ceil(4);

    let name = match p.mode {
        PoolingMode::Max => POOL_MAX_KERNEL,
        PoolingMode::Mean => POOL_MEAN_KERNEL,
    };
    let launch = KernelLaunch {
        name,
        global: [
            (ow as u32).div_ceil(WG[0]).max(1),
            (oh as u32).div_ceil(WG[1]).max(1),
            groups as u32,
        ],
        buffers: vec![in_buf, out_buf],
        params: vec![
            input.desc.width() as u32,
            input.desc.height() as u32,
            ow as u32,
            oh as u32,
            groups as u32,
            kw as u32,
            kh as u32,
            sw as u32,
            sh as u32,
            pl as u32,
            pt as u32,
        ],
    };
    dev.enqueue(&launch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::MemoryDescriptor;
    use crate::device::BufferId;
    use crate::device::testing::RecordingDevice;
    use crate::ops::pooling::RoundingMode;

    fn params() -> PoolingParams {
        PoolingParams {
            mode: PoolingMode::Max,
            kernel: (2, 2),
            stride: (2, 2),
            padding: (0, 0, 0, 0),
            rounding: RoundingMode::Floor,
        }
    }

    #[test]
    fn linear_input_is_rejected_before_enqueue() {
        let mut dev = RecordingDevice::new();
        let input = TensorDescriptor::nchw(DataType::F32, 1, 4, 4, 4);
        let (out, _, out_mem) = infer_output_size(&input, &params()).unwrap();
        let bad = MemoryDescriptor::linear(DataType::F32, input.num_elements());
        let iv = DeviceTensor { desc: &input, mem: &bad, buf: Some(BufferId(1)) };
        let ov = DeviceTensor { desc: &out, mem: &out_mem, buf: Some(BufferId(2)) };
        assert_eq!(execute(&mut dev, &iv, &params(), &ov), Err(Error::UnsupportedLayout));
        assert!(dev.events.is_empty());
    }

    #[test]
    fn valid_operands_enqueue_one_kernel() {
        let mut dev = RecordingDevice::new();
        let input = TensorDescriptor::nchw(DataType::F32, 1, 4, 4, 4);
        let (out, in_mem, out_mem) = infer_output_size(&input, &params()).unwrap();
        let iv = DeviceTensor { desc: &input, mem: &in_mem, buf: Some(BufferId(1)) };
        let ov = DeviceTensor { desc: &out, mem: &out_mem, buf: Some(BufferId(2)) };
        execute(&mut dev, &iv, &params(), &ov).unwrap();
        assert_eq!(dev.enqueue_count(), 1);
    }
}
