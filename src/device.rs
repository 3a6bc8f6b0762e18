//! Device/runtime handle abstraction.
//!
//! Every GPU-side operation in this crate is expressed against the
//! [`Device`] trait: buffer allocation and destruction, host↔device copies,
//! kernel enqueue, queue drain, and profiling. The production implementation
//! lives in [`crate::ops::gpu::wgpu`] (feature `wgpu`); tests substitute an
//! allocation-tracking fake so device-ordering properties can be asserted
//! without hardware.
//!
//! The model is single-queue and synchronous-per-call: work is enqueued and
//! then explicitly drained with [`Device::finish`] at well-defined points.
//! Nothing here is cancellable; a stuck device call blocks the calling
//! thread. A device handle is owned by one operator pipeline at a time and
//! is not safe for concurrent use.

use std::time::Duration;

use crate::desc::MemoryDescriptor;
use crate::error::Error;

/// Opaque handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A single kernel dispatch.
///
/// `global` counts workgroups along each axis. `params` are small immediate
/// arguments delivered to the kernel ahead of its buffer operands.
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    /// Name of the kernel pipeline to run.
    pub name: &'static str,
    /// Workgroup counts along x, y, z.
    pub global: [u32; 3],
    /// Buffer operands, bound in order after the parameter block.
    pub buffers: Vec<BufferId>,
    /// Immediate parameter block.
    pub params: Vec<u32>,
}

/// Handle to a compute device with one command queue.
pub trait Device {
    /// Allocates a buffer satisfying `desc` and returns its handle.
    fn alloc_buffer(&mut self, desc: &MemoryDescriptor) -> Result<BufferId, Error>;

    /// Releases an allocation. Unknown handles are ignored.
    fn free_buffer(&mut self, buf: BufferId);

    /// Copies host bytes into a buffer, starting at offset zero.
    fn write_buffer(&mut self, buf: BufferId, bytes: &[u8]) -> Result<(), Error>;

    /// Copies a buffer's prefix back to the host. Drains the queue first so
    /// pending writes are visible.
    fn read_buffer(&mut self, buf: BufferId, out: &mut [u8]) -> Result<(), Error>;

    /// Records a kernel dispatch on the queue. The kernel does not run until
    /// the queue is drained.
    fn enqueue(&mut self, launch: &KernelLaunch) -> Result<(), Error>;

    /// Submits all recorded work and blocks until the device is idle.
    fn finish(&mut self) -> Result<(), Error>;

    /// Enables or disables timing of drained work.
    fn set_profiling(&mut self, enabled: bool);

    /// Elapsed time of the most recent profiled [`Device::finish`], if any.
    fn elapsed(&self) -> Option<Duration>;

    /// Discards recorded-but-unsubmitted work.
    fn clear_queue(&mut self);
}
