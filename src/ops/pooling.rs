//! Spatial pooling operator.
//!
//! Follows the four-phase contract: output-size inference with CEIL/FLOOR
//! rounding and the global-pooling special case, a no-op algorithm phase
//! (pooling has no tunable configurations), zero scratch, and validated
//! execution dispatched over the active backend.

use core::str::FromStr;

use crate::backend::Arch;
use crate::desc::{DataType, TensorDescriptor, TensorLayout, windowed_extent};
use crate::error::Error;
use crate::ops::{Context, cpu, gpu};
use crate::tensor::Tensor;

/// Pooling reduction flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingMode {
    /// Window maximum.
    Max,
    /// Window mean over in-bounds elements.
    Mean,
}

/// Output-extent rounding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    /// Round the window count up: trailing partial windows produce output.
    Ceil,
    /// Truncate: trailing partial windows are dropped.
    Floor,
}

impl FromStr for RoundingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ceil" | "CEIL" => Ok(Self::Ceil),
            "floor" | "FLOOR" => Ok(Self::Floor),
            _ => Err(Error::UnsupportedRoundingMode),
        }
    }
}

/// Pooling parameters.
///
/// All pairs are `(height, width)` ordered; padding is
/// `(top, bottom, left, right)`. A zero kernel in both spatial dims means
/// global pooling: the full input extent is used as the kernel, collapsing
/// the output to 1×1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingParams {
    /// Reduction flavor.
    pub mode: PoolingMode,
    /// Window extents; `(0, 0)` selects global pooling.
    pub kernel: (usize, usize),
    /// Window steps.
    pub stride: (usize, usize),
    /// Pad extents around the input.
    pub padding: (usize, usize, usize, usize),
    /// Output-extent rounding direction.
    pub rounding: RoundingMode,
}

impl PoolingParams {
    /// Resolves the global-pooling sentinel against a concrete input,
    /// returning parameters whose kernel extents are the input extents.
    pub(crate) fn resolved(&self, input: &TensorDescriptor) -> Result<Self, Error> {
        if self.kernel != (0, 0) {
            return Ok(*self);
        }
        if input.rank() != 4 {
            return Err(Error::ShapeMismatch);
        }
        let mut p = *self;
        p.kernel = (input.height(), input.width());
        Ok(p)
    }
}

/// Pure output-shape inference shared by every backend.
pub(crate) fn output_desc(
    input: &TensorDescriptor,
    p: &PoolingParams,
) -> Result<TensorDescriptor, Error> {
    if input.layout() != TensorLayout::Nchw {
        return Err(Error::UnsupportedLayout);
    }
    let p = p.resolved(input)?;
    let (kh, kw) = p.kernel;
    let (sh, sw) = p.stride;
    let (pt, pb, pl, pr) = p.padding;
    let ceil = p.rounding == RoundingMode::Ceil;
    let oh = windowed_extent(input.height(), kh, sh, pt, pb, ceil)?;
    let ow = windowed_extent(input.width(), kw, sw, pl, pr, ceil)?;
    Ok(TensorDescriptor::nchw(input.dt(), input.batch(), input.channels(), oh, ow))
}

/// The pooling operator.
pub struct Pooling {
    p: PoolingParams,
}

impl Pooling {
    /// Creates a pooling operator with the given parameters.
    pub fn new(p: PoolingParams) -> Self {
        Self { p }
    }

    /// Phase 1: computes the output descriptor, resizes `output` to it, and
    /// on the GPU backend installs fresh memory descriptors on both
    /// tensors.
    pub fn infer_output_size(
        &self,
        ctx: &Context<'_>,
        input: &mut Tensor,
        output: &mut Tensor,
    ) -> Result<(), Error> {
        match ctx.arch() {
            Arch::Gpu => {
                let (out, in_mem, out_mem) = gpu::pooling::infer_output_size(input.desc(), &self.p)?;
                output.resize(out);
                input.set_device_mem(in_mem);
                output.set_device_mem(out_mem);
            }
            Arch::CpuGeneral | Arch::CpuSimd => {
                let out = output_desc(input.desc(), &self.p)?;
                output.resize(out);
            }
        }
        Ok(())
    }

    /// Phase 2: pooling has exactly one kernel per mode, so there is
    /// nothing to select.
    pub fn infer_forward_algorithm(&mut self, _ctx: &mut Context<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Phase 3: scratch sizing. The kernels on every backend are
    /// layout-native, so no scratch is required.
    pub fn infer_forward_tmp_bytes(
        &self,
        _ctx: &Context<'_>,
        input: &Tensor,
    ) -> Result<usize, Error> {
        match input.desc().dt() {
            DataType::F32 => Ok(0),
            _ => Err(Error::UnsupportedDatatype),
        }
    }

    /// Phase 4: validated execution.
    ///
    /// On the GPU backend this uploads the input if it is not already
    /// device-resident, dispatches, drains the queue, and reads the output
    /// back into host order. Device buffers bound to the tensors stay alive
    /// for reuse; the caller frees them through the device when the tensors
    /// retire.
    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        input: &mut Tensor,
        output: &mut Tensor,
    ) -> Result<(), Error> {
        let expected = output_desc(input.desc(), &self.p)?;
        if *output.desc() != expected {
            return Err(Error::ShapeMismatch);
        }
        match input.desc().dt() {
            DataType::F32 => {}
            _ => return Err(Error::UnsupportedDatatype),
        }
        let p = self.p.resolved(input.desc())?;
        match ctx.arch() {
            Arch::CpuGeneral => {
                cpu::pooling::pooling_general(input.desc(), input.data(), &p, output.data_mut())
            }
            Arch::CpuSimd => {
                cpu::pooling::pooling_simd(input.desc(), input.data(), &p, output.data_mut())
            }
            Arch::Gpu => {
                let dev = ctx.device()?;
                if input.device_buf().is_none() {
                    let mem = input.device_mem().ok_or(Error::NullArgument)?.clone();
                    let buf = dev.alloc_buffer(&mem)?;
                    let packed = gpu::pack_nchw(input.desc(), &mem, input.data());
                    dev.write_buffer(buf, briny::raw::slice_to_bytes(&packed))?;
                    input.bind_device(buf);
                }
                if output.device_buf().is_none() {
                    let mem = output.device_mem().ok_or(Error::NullArgument)?.clone();
                    let buf = dev.alloc_buffer(&mem)?;
                    output.bind_device(buf);
                }
                let iv = gpu::DeviceTensor::of(input)?;
                let ov = gpu::DeviceTensor::of(output)?;
                gpu::pooling::execute(dev, &iv, &p, &ov)?;
                dev.finish()?;

                let out_mem = output.device_mem().ok_or(Error::NullArgument)?.clone();
                let out_buf = output.device_buf().ok_or(Error::NullArgument)?;
                let mut bytes = vec![0u8; out_mem.byte_size];
                dev.read_buffer(out_buf, &mut bytes)?;
                let packed = gpu::decode_f32(&bytes);
                gpu::unpack_nchw(&expected, &packed, output.data_mut());
                Ok(())
            }
        }
    }
}
