//! Operator execution protocol.
//!
//! Every operator follows the same four-phase contract, invoked in order
//! once per unique input shape:
//!
//! 1. `infer_output_size` — shape inference; on the GPU backend this also
//!    derives the device memory descriptors for the operands.
//! 2. `infer_forward_algorithm` — kernel configuration selection. On the GPU
//!    this is the autotuning entry point: idempotent, a no-op when a
//!    configuration is already cached.
//! 3. `infer_forward_tmp_bytes` — scratch-buffer sizing for the selected
//!    configuration.
//! 4. `execute` — operand validation and dispatch to the concrete kernel.
//!
//! Dispatch over backends goes through the closed [`Arch`] tag; backend
//! state (the device queue) travels in an explicit [`Context`] passed by
//! reference into every phase.
//!
//! ## Submodules
//!
//! - [`cpu`] — reference kernels, general and SIMD-flavoured
//! - [`gpu`] — memory-descriptor inference, candidate generation, autotuning
//!   and kernel enqueue
//! - [`pooling`], [`fully_connected`] — the operators

pub mod cpu;
pub mod fully_connected;
pub mod gpu;
pub mod pooling;

use crate::backend::Arch;
use crate::device::Device;
use crate::error::Error;

/// Execution context threaded through every operator phase.
///
/// Bundles the backend tag with the mutable device handle the GPU path
/// needs. The context borrows the device; its lifecycle (profiling state,
/// queue contents) is managed by the operations themselves with guaranteed
/// cleanup on every exit path.
pub struct Context<'d> {
    arch: Arch,
    device: Option<&'d mut dyn Device>,
}

impl<'d> Context<'d> {
    /// A CPU context. `arch` may be [`Arch::CpuGeneral`] or
    /// [`Arch::CpuSimd`]; passing [`Arch::Gpu`] here makes every GPU phase
    /// fail with [`Error::NullArgument`] since no device is attached.
    pub fn cpu(arch: Arch) -> Self {
        Self { arch, device: None }
    }

    /// A GPU context borrowing the given device handle.
    pub fn gpu(device: &'d mut dyn Device) -> Self {
        Self { arch: Arch::Gpu, device: Some(device) }
    }

    /// The backend this context dispatches to.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The attached device handle, or [`Error::NullArgument`] when the
    /// context has none.
    pub fn device(&mut self) -> Result<&mut dyn Device, Error> {
        match self.device.as_mut() {
            Some(d) => Ok(&mut **d),
            None => Err(Error::NullArgument),
        }
    }
}
