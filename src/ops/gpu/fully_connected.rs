//! Fully-connected kernels on the GPU backend: memory-descriptor inference,
//! weight-transform and scratch sizing, operand validation, and dispatch.
//!
//! Every entry here is pure with respect to the device except [`execute`],
//! which validates first and only then records work on the queue.

use crate::desc::{
    DataType, MemoryDescriptor, StorageClass, TensorDescriptor, TensorLayout, align_up,
    mkt_to_chanvec4, nchw_to_chanvec4, padded_time_extent,
};
use crate::device::{BufferId, Device, KernelLaunch};
use crate::error::Error;

use super::{DeviceTensor, candidates, chanvec4_mem};
use candidates::KernelConfiguration;

/// Pipeline name of the direct fully-connected kernel.
pub(crate) const FC_KERNEL: &str = "fully_connected_direct";

/// Workgroup extents the kernel is compiled with.
const WG: [u32; 2] = [8, 8];

/// Infers the output descriptor and the input/output memory descriptors for
/// a fully-connected layer on this backend.
///
/// For sequence-packed inputs the buffer's time extent is padded so that any
/// tile width the autotuner might pick fits without reallocation; the
/// returned input descriptor carries `need_pad` when the padded extent
/// differs from the natural one.
pub fn infer_output_size(
    input: &TensorDescriptor,
    filter: &TensorDescriptor,
) -> Result<(TensorDescriptor, MemoryDescriptor, MemoryDescriptor), Error> {
    let n_out = filter.batch();
    match input.layout() {
        TensorLayout::Nchw => {
            let out = TensorDescriptor::nchw(input.dt(), input.batch(), n_out, 1, 1);
            let (iw, ih, ig) = nchw_to_chanvec4(input.channels(), input.height(), input.width());
            let in_mem = MemoryDescriptor::chan_vec4(input.dt(), iw, ih, ig, false);
            let out_mem = chanvec4_mem(input.dt(), 1, 1, n_out, false);
            Ok((out, in_mem, out_mem))
        }
        TensorLayout::Mkt => {
            let (m, k, t) = input.mkt_dims();
            let out = TensorDescriptor::mkt(input.dt(), m, n_out, t);
            let set = candidates::fully_connected_candidates(input, filter, &[out])?;
            let t_align = padded_time_extent(t, set.tile_widths());
            let need_pad = t_align != t;
            let (iw, ih, ig) = mkt_to_chanvec4(m, k, t_align);
            let in_mem = MemoryDescriptor::chan_vec4(input.dt(), iw, ih, ig, need_pad);
            let (ow, oh, og) = mkt_to_chanvec4(m, n_out, t);
            let out_mem = MemoryDescriptor::chan_vec4(input.dt(), ow, oh, og, false);
            Ok((out, in_mem, out_mem))
        }
        TensorLayout::ChanVec4 => Err(Error::UnsupportedLayout),
    }
}

/// Sizes the transformed (device-packed) weight buffer for a configuration,
/// and the transient bytes the transform itself needs.
pub fn transform_filter_bytes(
    filter: &TensorDescriptor,
    cfg: &KernelConfiguration,
) -> Result<(MemoryDescriptor, usize), Error> {
    match filter.dt() {
        DataType::F32 => {}
        _ => return Err(Error::UnsupportedDatatype),
    }
    let (n, c, h, w) = (filter.batch(), filter.channels(), filter.height(), filter.width());
    let kk = cfg.vec_k.max(4) as usize;
    let cc = cfg.group_c.max(1) as usize;
    let padded_n = align_up(n, kk);
    let padded_c = align_up(c, cc);
    let elems = padded_n * padded_c * h * w;
    let mem = MemoryDescriptor {
        stride: [h * w, padded_c, padded_n],
        offset: [0, 0, 0],
        byte_size: elems * filter.dt().size(),
        storage: StorageClass::Buffer,
        format: crate::desc::DeviceFormat::WeightVec4,
        dt: filter.dt(),
        need_pad: padded_n != n || padded_c != c,
    };
    Ok((mem, filter.num_bytes()))
}

/// Scratch bytes the direct kernel needs for this configuration.
pub fn infer_forward_tmp_bytes(
    input: &TensorDescriptor,
    filter: &TensorDescriptor,
    cfg: &KernelConfiguration,
) -> Result<usize, Error> {
    match input.dt() {
        DataType::F32 => {}
        _ => return Err(Error::UnsupportedDatatype),
    }
    match input.layout() {
        TensorLayout::Nchw => {
            if filter.height() == 1 && filter.width() == 1 {
                Ok(0)
            } else {
                // Staging copy of the vectorized input window.
                let (w, h, g) = nchw_to_chanvec4(input.channels(), input.height(), input.width());
                Ok(w * h * g * 4 * input.dt().size())
            }
        }
        TensorLayout::Mkt => {
            let (m, k, t) = input.mkt_dims();
            if cfg.tile_w <= 1 {
                Ok(0)
            } else {
                let t_align = align_up(t, cfg.tile_w as usize);
                Ok(m * t_align * k.div_ceil(4) * 4 * input.dt().size())
            }
        }
        TensorLayout::ChanVec4 => Err(Error::UnsupportedLayout),
    }
}

/// Pre-execution operand validation.
///
/// Runs on every call, inside and outside autotuning, strictly before any
/// device work: null-handle checks, arity checks, device-layout checks, and
/// shape consistency. The spatial path only supports a single batch and a
/// single output slice.
pub fn check_operands(
    input: &DeviceTensor<'_>,
    filters: &[DeviceTensor<'_>],
    biases: &[DeviceTensor<'_>],
    outputs: &[DeviceTensor<'_>],
) -> Result<(), Error> {
    if input.buf.is_none() {
        return Err(Error::NullArgument);
    }
    if filters.is_empty() || filters.len() != outputs.len() || filters.len() != biases.len() {
        return Err(Error::ArityMismatch);
    }
    for op in filters.iter().chain(biases).chain(outputs) {
        if op.buf.is_none() {
            return Err(Error::NullArgument);
        }
    }
    let fd = filters[0].desc;
    match input.desc.layout() {
        TensorLayout::Nchw => {
            if input.mem.format != crate::desc::DeviceFormat::ChanVec4
                || filters[0].mem.format != crate::desc::DeviceFormat::WeightVec4
                || outputs[0].mem.format != crate::desc::DeviceFormat::ChanVec4
            {
                return Err(Error::UnsupportedLayout);
            }
            if input.desc.batch() > 1 {
                return Err(Error::UnsupportedLayout);
            }
            if filters.len() > 1 {
                return Err(Error::ArityMismatch);
            }
            if fd.width() != input.desc.width()
                || fd.height() != input.desc.height()
                || fd.channels() != input.desc.channels()
                || fd.batch() != outputs[0].desc.channels()
            {
                return Err(Error::ShapeMismatch);
            }
        }
        TensorLayout::Mkt => {
            let (_, k, _) = input.desc.mkt_dims();
            if fd.height() != 1 || fd.width() != 1 {
                return Err(Error::ShapeMismatch);
            }
            if fd.channels() != k {
                return Err(Error::ShapeMismatch);
            }
        }
        TensorLayout::ChanVec4 => return Err(Error::UnsupportedLayout),
    }
    Ok(())
}

/// Records the direct fully-connected kernel on the queue, one dispatch per
/// output slice.
///
/// Requires a finalized configuration and scratch of at least the size
/// [`infer_forward_tmp_bytes`] reported. Validation runs first; no device
/// work is issued when any operand is rejected.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    dev: &mut dyn Device,
    input: &DeviceTensor<'_>,
    filters: &[DeviceTensor<'_>],
    biases: &[DeviceTensor<'_>],
    tmp: Option<BufferId>,
    tmp_bytes: usize,
    outputs: &[DeviceTensor<'_>],
    cfg: &KernelConfiguration,
) -> Result<(), Error> {
    check_operands(input, filters, biases, outputs)?;
    match input.desc.dt() {
        DataType::F32 => {}
        _ => return Err(Error::UnsupportedDatatype),
    }
    let required = infer_forward_tmp_bytes(input.desc, filters[0].desc, cfg)?;
    if required > 0 {
        if tmp.is_none() {
            return Err(Error::NullArgument);
        }
        if tmp_bytes < required {
            return Err(Error::ShapeMismatch);
        }
    }

    let (w_items, in_feats, t_nat) = match input.desc.layout() {
        TensorLayout::Mkt => {
            let (m, k, t) = input.desc.mkt_dims();
            (m, k, t)
        }
        _ => (1, input.desc.channels(), 1),
    };
    let t_stride = input.mem.stride[1];
    let padded_c = filters[0].mem.stride[1];
    let in_buf = input.buf.ok_or(Error::NullArgument)?;

    for (i, out) in outputs.iter().enumerate() {
        let n_slice = out.desc.channels();
        let tiles = match input.desc.layout() {
            TensorLayout::Mkt => t_nat.div_ceil(cfg.tile_w.max(1) as usize) as u32,
            _ => 1,
        };
        let launch = KernelLaunch {
            name: FC_KERNEL,
            global: [
                tiles.div_ceil(WG[0]).max(1),
                (n_slice.div_ceil(4) as u32).div_ceil(WG[1]).max(1),
                w_items as u32,
            ],
            buffers: vec![
                in_buf,
                filters[i].buf.ok_or(Error::NullArgument)?,
                biases[i].buf.ok_or(Error::NullArgument)?,
                out.buf.ok_or(Error::NullArgument)?,
            ],
            params: vec![
                w_items as u32,
                in_feats as u32,
                t_nat as u32,
                t_stride as u32,
                n_slice as u32,
                cfg.tile_w,
                cfg.group_c,
                cfg.vec_k,
                padded_c as u32,
            ],
        };
        dev.enqueue(&launch)?;
    }
    Ok(())
}
