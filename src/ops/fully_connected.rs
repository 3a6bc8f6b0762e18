//! Fully-connected (inner-product) operator.
//!
//! Covers the spatial layout — including the degenerate "fully-connected as
//! 1×1 convolution" — and the sequence-packed MKT layout, with one or more
//! output slices (multi-head splits share one input and one stacked
//! filter).
//!
//! The operator owns the per-shape state the four-phase contract produces:
//! the tuned kernel configuration (GPU), the repacked weight and bias
//! buffers (uploaded once, reused across calls), and the scratch
//! allocation. None of that state is safe to share between threads; callers
//! serialize access per operator instance.

use crate::backend::Arch;
use crate::desc::{DataType, TensorDescriptor, TensorLayout};
use crate::device::{BufferId, Device};
use crate::error::Error;
use crate::ops::gpu::candidates::KernelConfiguration;
use crate::ops::{Context, cpu, gpu};
use crate::tensor::Tensor;

/// Pure output-shape inference shared by every backend: the channel/feature
/// extent becomes the filter's output count, spatial extents collapse.
pub(crate) fn output_desc(
    input: &TensorDescriptor,
    filter: &TensorDescriptor,
) -> Result<TensorDescriptor, Error> {
    let n_out = filter.batch();
    match input.layout() {
        TensorLayout::Nchw => {
            Ok(TensorDescriptor::nchw(input.dt(), input.batch(), n_out, 1, 1))
        }
        TensorLayout::Mkt => {
            let (m, _, t) = input.mkt_dims();
            Ok(TensorDescriptor::mkt(input.dt(), m, n_out, t))
        }
        TensorLayout::ChanVec4 => Err(Error::UnsupportedLayout),
    }
}

/// The fully-connected operator.
pub struct FullyConnected {
    filter_desc: TensorDescriptor,
    config: Option<KernelConfiguration>,
    transformed: Vec<BufferId>,
    bias_bufs: Vec<BufferId>,
    scratch: Option<(BufferId, usize)>,
}

impl FullyConnected {
    /// Creates the operator for a filter of the given shape
    /// (`[n_out, channels, height, width]`).
    pub fn new(filter_desc: TensorDescriptor) -> Self {
        Self {
            filter_desc,
            config: None,
            transformed: Vec::new(),
            bias_bufs: Vec::new(),
            scratch: None,
        }
    }

    /// The tuned kernel configuration, if one has been selected.
    pub fn config(&self) -> Option<KernelConfiguration> {
        self.config
    }

    /// Installs a previously persisted configuration, skipping autotuning
    /// on the next [`FullyConnected::infer_forward_algorithm`].
    pub fn set_config(&mut self, cfg: KernelConfiguration) {
        self.config = Some(cfg);
    }

    /// Phase 1: computes output descriptors, resizes the outputs, and on
    /// the GPU backend installs fresh memory descriptors on every tensor.
    ///
    /// With a single output its descriptor is derived from the filter; with
    /// multiple slices the outputs' channel extents must already be set and
    /// sum to the filter's output count.
    pub fn infer_output_size(
        &self,
        ctx: &Context<'_>,
        input: &mut Tensor,
        outputs: &mut [Tensor],
    ) -> Result<(), Error> {
        if outputs.is_empty() {
            return Err(Error::NullArgument);
        }
        let full = output_desc(input.desc(), &self.filter_desc)?;
        if outputs.len() > 1 {
            let total: usize = outputs.iter().map(|o| o.desc().channels()).sum();
            if total != self.filter_desc.batch() {
                return Err(Error::ShapeMismatch);
            }
        }
        let single = outputs.len() == 1;
        match ctx.arch() {
            Arch::Gpu => {
                let (_, in_mem, _) =
                    gpu::fully_connected::infer_output_size(input.desc(), &self.filter_desc)?;
                input.set_device_mem(in_mem);
                for o in outputs.iter_mut() {
                    let n = if single { full.channels() } else { o.desc().channels() };
                    let d = full.with_channels(n);
                    let mem = match d.layout() {
                        TensorLayout::Mkt => {
                            let (m, _, t) = d.mkt_dims();
                            gpu::chanvec4_mem(d.dt(), m, t, n, false)
                        }
                        _ => gpu::chanvec4_mem(d.dt(), 1, 1, n, false),
                    };
                    o.resize(d);
                    o.set_device_mem(mem);
                }
            }
            Arch::CpuGeneral | Arch::CpuSimd => {
                for o in outputs.iter_mut() {
                    let n = if single { full.channels() } else { o.desc().channels() };
                    o.resize(full.with_channels(n));
                }
            }
        }
        Ok(())
    }

    /// Phase 2: the autotuning entry point.
    ///
    /// Idempotent: a no-op when a configuration is already cached. On CPU
    /// backends the kernels have no configuration space and this always
    /// succeeds.
    pub fn infer_forward_algorithm(
        &mut self,
        ctx: &mut Context<'_>,
        input: &Tensor,
        outputs: &[Tensor],
    ) -> Result<(), Error> {
        match ctx.arch() {
            Arch::Gpu => {
                let out_descs: Vec<TensorDescriptor> =
                    outputs.iter().map(|o| *o.desc()).collect();
                let input_desc = *input.desc();
                let filter_desc = self.filter_desc;
                gpu::tuning::select_forward_algorithm(
                    ctx.device()?,
                    &input_desc,
                    &filter_desc,
                    &out_descs,
                    &mut self.config,
                )
            }
            Arch::CpuGeneral | Arch::CpuSimd => Ok(()),
        }
    }

    /// Phase 3: scratch bytes for the selected configuration. On the GPU a
    /// configuration must have been selected first.
    pub fn infer_forward_tmp_bytes(
        &self,
        ctx: &Context<'_>,
        input: &Tensor,
    ) -> Result<usize, Error> {
        match ctx.arch() {
            Arch::Gpu => {
                let cfg = self.config.as_ref().ok_or(Error::NullArgument)?;
                gpu::fully_connected::infer_forward_tmp_bytes(
                    input.desc(),
                    &self.filter_desc,
                    cfg,
                )
            }
            Arch::CpuGeneral | Arch::CpuSimd => match input.desc().dt() {
                DataType::F32 => Ok(0),
                _ => Err(Error::UnsupportedDatatype),
            },
        }
    }

    /// Phase 4: validated execution.
    ///
    /// `filter` holds all output slices stacked along its first extent;
    /// `bias`, when present, is one value per output unit across all
    /// slices. On the GPU the filter and bias are repacked into device
    /// layout on first use and the packed copies are reused by every later
    /// call; repacking is not redone per call.
    pub fn execute(
        &mut self,
        ctx: &mut Context<'_>,
        input: &mut Tensor,
        filter: &Tensor,
        bias: Option<&Tensor>,
        outputs: &mut [Tensor],
    ) -> Result<(), Error> {
        if outputs.is_empty() {
            return Err(Error::ArityMismatch);
        }
        if *filter.desc() != self.filter_desc {
            return Err(Error::ShapeMismatch);
        }
        let n_total = self.filter_desc.batch();
        let sliced: usize = outputs.iter().map(|o| o.desc().channels()).sum();
        if sliced != n_total {
            return Err(Error::ShapeMismatch);
        }
        match input.desc().dt() {
            DataType::F32 => {}
            _ => return Err(Error::UnsupportedDatatype),
        }

        match ctx.arch() {
            Arch::CpuGeneral | Arch::CpuSimd => {
                self.execute_cpu(ctx.arch(), input, filter, bias, outputs)
            }
            Arch::Gpu => self.execute_gpu(ctx, input, filter, bias, outputs),
        }
    }

    fn execute_cpu(
        &self,
        arch: Arch,
        input: &Tensor,
        filter: &Tensor,
        bias: Option<&Tensor>,
        outputs: &mut [Tensor],
    ) -> Result<(), Error> {
        let fd = &self.filter_desc;
        let reduce = fd.channels() * fd.height() * fd.width();
        let mut offset = 0usize;
        for out in outputs.iter_mut() {
            let n_j = out.desc().channels();
            let slice_desc =
                TensorDescriptor::nchw(fd.dt(), n_j, fd.channels(), fd.height(), fd.width());
            let w = &filter.data()[offset * reduce..(offset + n_j) * reduce];
            let b = bias.map(|b| &b.data()[offset..offset + n_j]);
            match arch {
                Arch::CpuSimd => cpu::fully_connected::fully_connected_simd(
                    input.desc(),
                    input.data(),
                    &slice_desc,
                    w,
                    b,
                    out.data_mut(),
                )?,
                _ => cpu::fully_connected::fully_connected_general(
                    input.desc(),
                    input.data(),
                    &slice_desc,
                    w,
                    b,
                    out.data_mut(),
                )?,
            }
            offset += n_j;
        }
        Ok(())
    }

    fn execute_gpu(
        &mut self,
        ctx: &mut Context<'_>,
        input: &mut Tensor,
        filter: &Tensor,
        bias: Option<&Tensor>,
        outputs: &mut [Tensor],
    ) -> Result<(), Error> {
        let cfg = self.config.ok_or(Error::NullArgument)?;
        let fd = self.filter_desc;
        let dev = ctx.device()?;

        // Upload the input if it is not already resident. Packing honors the
        // descriptor's pad region by zero-filling it.
        if input.device_buf().is_none() {
            let mem = input.device_mem().ok_or(Error::NullArgument)?.clone();
            let buf = dev.alloc_buffer(&mem)?;
            let packed = match input.desc().layout() {
                TensorLayout::Mkt => gpu::pack_mkt(input.desc(), &mem, input.data()),
                _ => gpu::pack_nchw(input.desc(), &mem, input.data()),
            };
            dev.write_buffer(buf, briny::raw::slice_to_bytes(&packed))?;
            input.bind_device(buf);
        }

        // Repack weights and bias once, cache the device copies.
        let mut slice_descs = Vec::with_capacity(outputs.len());
        let mut filter_mems = Vec::with_capacity(outputs.len());
        let reduce = fd.channels() * fd.height() * fd.width();
        let mut offset = 0usize;
        for out in outputs.iter() {
            let n_j = out.desc().channels();
            let sd = TensorDescriptor::nchw(fd.dt(), n_j, fd.channels(), fd.height(), fd.width());
            let (fmem, _) = gpu::fully_connected::transform_filter_bytes(&sd, &cfg)?;
            slice_descs.push(sd);
            filter_mems.push(fmem);
            offset += n_j;
        }
        debug_assert_eq!(offset, fd.batch());
        if self.transformed.len() != outputs.len() {
            for old in self.transformed.drain(..).chain(self.bias_bufs.drain(..)) {
                dev.free_buffer(old);
            }
            let mut offset = 0usize;
            for (j, out) in outputs.iter().enumerate() {
                let n_j = out.desc().channels();
                let fbuf = dev.alloc_buffer(&filter_mems[j])?;
                let w = &filter.data()[offset * reduce..(offset + n_j) * reduce];
                let packed = gpu::pack_filter(&slice_descs[j], w, &cfg);
                dev.write_buffer(fbuf, briny::raw::slice_to_bytes(&packed))?;
                self.transformed.push(fbuf);

                let bias_mem = match input.desc().layout() {
                    TensorLayout::Mkt => {
                        crate::desc::MemoryDescriptor::image1d(fd.dt(), n_j.div_ceil(4))
                    }
                    _ => crate::desc::MemoryDescriptor::linear(fd.dt(), n_j),
                };
                let bbuf = dev.alloc_buffer(&bias_mem)?;
                let zeros;
                let b_host = match bias {
                    Some(b) => &b.data()[offset..offset + n_j],
                    None => {
                        zeros = vec![0.0f32; n_j];
                        &zeros[..]
                    }
                };
                let packed_bias = gpu::pack_bias(n_j, b_host);
                dev.write_buffer(bbuf, briny::raw::slice_to_bytes(&packed_bias))?;
                self.bias_bufs.push(bbuf);
                offset += n_j;
            }
        }

        // Scratch, grown on demand and cached.
        let required =
            gpu::fully_connected::infer_forward_tmp_bytes(input.desc(), &fd, &cfg)?;
        if required > 0 && self.scratch.map_or(true, |(_, size)| size < required) {
            if let Some((old, _)) = self.scratch.take() {
                dev.free_buffer(old);
            }
            let mem = crate::desc::MemoryDescriptor::linear(fd.dt(), required.div_ceil(4));
            self.scratch = Some((dev.alloc_buffer(&mem)?, required));
        }

        // Output allocations.
        for out in outputs.iter_mut() {
            if out.device_buf().is_none() {
                let mem = out.device_mem().ok_or(Error::NullArgument)?.clone();
                let buf = dev.alloc_buffer(&mem)?;
                out.bind_device(buf);
            }
        }

        let input_view = gpu::DeviceTensor::of(input)?;
        let mut bias_mems = Vec::with_capacity(outputs.len());
        for out in outputs.iter() {
            let n_j = out.desc().channels();
            bias_mems.push(match input.desc().layout() {
                TensorLayout::Mkt => {
                    crate::desc::MemoryDescriptor::image1d(fd.dt(), n_j.div_ceil(4))
                }
                _ => crate::desc::MemoryDescriptor::linear(fd.dt(), n_j),
            });
        }
        let mut filter_views = Vec::with_capacity(outputs.len());
        let mut bias_views = Vec::with_capacity(outputs.len());
        let mut out_views = Vec::with_capacity(outputs.len());
        for (j, out) in outputs.iter().enumerate() {
            filter_views.push(gpu::DeviceTensor {
                desc: &slice_descs[j],
                mem: &filter_mems[j],
                buf: Some(self.transformed[j]),
            });
            bias_views.push(gpu::DeviceTensor {
                desc: &slice_descs[j],
                mem: &bias_mems[j],
                buf: Some(self.bias_bufs[j]),
            });
            out_views.push(gpu::DeviceTensor::of(out)?);
        }
        let (scratch_buf, scratch_bytes) =
            self.scratch.map_or((None, 0), |(b, s)| (Some(b), s));
        gpu::fully_connected::execute(
            dev,
            &input_view,
            &filter_views,
            &bias_views,
            scratch_buf,
            scratch_bytes,
            &out_views,
            &cfg,
        )?;
        dev.finish()?;

        for out in outputs.iter_mut() {
            let mem = out.device_mem().ok_or(Error::NullArgument)?.clone();
            let buf = out.device_buf().ok_or(Error::NullArgument)?;
            let mut bytes = vec![0u8; mem.byte_size];
            dev.read_buffer(buf, &mut bytes)?;
            let packed = gpu::decode_f32(&bytes);
            let desc = *out.desc();
            match desc.layout() {
                TensorLayout::Mkt => gpu::unpack_mkt(&desc, &mem, &packed, out.data_mut()),
                _ => gpu::unpack_nchw(&desc, &packed, out.data_mut()),
            }
        }
        Ok(())
    }

    /// Frees every cached device allocation (packed weights, bias, scratch).
    /// Call when the operator retires or the device is being torn down.
    pub fn release_device(&mut self, dev: &mut dyn Device) {
        for buf in self.transformed.drain(..).chain(self.bias_bufs.drain(..)) {
            dev.free_buffer(buf);
        }
        if let Some((buf, _)) = self.scratch.take() {
            dev.free_buffer(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq_slice;
    use crate::device::testing::{Event, RecordingDevice};

    fn mkt_operator() -> (FullyConnected, Tensor, Tensor, Tensor) {
        let filter_desc = TensorDescriptor::nchw(DataType::F32, 16, 8, 1, 1);
        let op = FullyConnected::new(filter_desc);
        let input = Tensor::new(
            TensorDescriptor::mkt(DataType::F32, 1, 8, 4),
            (0..32).map(|v| v as f32 * 0.25).collect(),
        );
        let filter = Tensor::new(filter_desc, (0..16 * 8).map(|v| (v % 7) as f32 * 0.5).collect());
        let bias = Tensor::new(
            TensorDescriptor::nchw(DataType::F32, 1, 16, 1, 1),
            (0..16).map(|v| v as f32).collect(),
        );
        (op, input, filter, bias)
    }

    #[test]
    fn cpu_multi_slice_matches_single_slice() {
        let (mut op, mut input, filter, bias) = mkt_operator();
        let mut ctx = Context::cpu(Arch::CpuGeneral);

        let mut single = vec![Tensor::zeros(TensorDescriptor::mkt(DataType::F32, 1, 16, 4))];
        op.infer_output_size(&ctx, &mut input, &mut single).unwrap();
        op.execute(&mut ctx, &mut input, &filter, Some(&bias), &mut single).unwrap();

        let mut split = vec![
            Tensor::zeros(TensorDescriptor::mkt(DataType::F32, 1, 10, 4)),
            Tensor::zeros(TensorDescriptor::mkt(DataType::F32, 1, 6, 4)),
        ];
        op.infer_output_size(&ctx, &mut input, &mut split).unwrap();
        op.execute(&mut ctx, &mut input, &filter, Some(&bias), &mut split).unwrap();

        let merged: Vec<f32> =
            split[0].data().iter().chain(split[1].data()).copied().collect();
        assert!(approx_eq_slice(single[0].data(), &merged));
    }

    #[test]
    fn gpu_execute_repacks_weights_only_once() {
        let mut dev = RecordingDevice::new();
        let (mut op, mut input, filter, bias) = mkt_operator();
        let mut outputs = vec![Tensor::zeros(TensorDescriptor::mkt(DataType::F32, 1, 16, 4))];
        {
            let mut ctx = Context::gpu(&mut dev);
            op.infer_output_size(&ctx, &mut input, &mut outputs).unwrap();
            op.infer_forward_algorithm(&mut ctx, &input, &outputs).unwrap();
            assert!(op.config().is_some());
            op.execute(&mut ctx, &mut input, &filter, Some(&bias), &mut outputs).unwrap();
        }
        let writes_after_first =
            dev.events.iter().filter(|e| matches!(e, Event::Write(_))).count();
        {
            let mut ctx = Context::gpu(&mut dev);
            op.execute(&mut ctx, &mut input, &filter, Some(&bias), &mut outputs).unwrap();
        }
        let writes_after_second =
            dev.events.iter().filter(|e| matches!(e, Event::Write(_))).count();
        assert_eq!(writes_after_first, writes_after_second, "no re-upload on the second call");
        op.release_device(&mut dev);
    }

    #[test]
    fn gpu_execute_without_configuration_is_rejected() {
        let mut dev = RecordingDevice::new();
        let (mut op, mut input, filter, bias) = mkt_operator();
        let mut outputs = vec![Tensor::zeros(TensorDescriptor::mkt(DataType::F32, 1, 16, 4))];
        let mut ctx = Context::gpu(&mut dev);
        op.infer_output_size(&ctx, &mut input, &mut outputs).unwrap();
        let err = op
            .execute(&mut ctx, &mut input, &filter, Some(&bias), &mut outputs)
            .unwrap_err();
        assert_eq!(err, Error::NullArgument);
    }

    #[test]
    fn tmp_bytes_requires_a_selected_configuration() {
        let (op, input, _, _) = mkt_operator();
        let mut dev = RecordingDevice::new();
        let ctx = Context::gpu(&mut dev);
        assert_eq!(op.infer_forward_tmp_bytes(&ctx, &input), Err(Error::NullArgument));
    }
}
