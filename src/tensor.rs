//! Host tensors with optional device residency.
//!
//! A [`Tensor`] owns a shape-checked flat `f32` payload in logical order
//! plus, when an operator has been prepared for the GPU backend, the
//! [`MemoryDescriptor`] and device buffer that mirror it. The descriptor and
//! buffer are created per inference call (or per model load, for weights)
//! and dropped with the owning tensor; they are never shared between
//! tensors.

use crate::desc::{MemoryDescriptor, TensorDescriptor};
use crate::device::BufferId;

/// An N-dimensional tensor: logical descriptor, host data, and (optionally)
/// a device-side mirror.
#[derive(Debug, Clone)]
pub struct Tensor {
    desc: TensorDescriptor,
    data: Vec<f32>,
    mem: Option<MemoryDescriptor>,
    buf: Option<BufferId>,
}

impl Tensor {
    /// Creates a tensor with the given descriptor and flat data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not match the descriptor's element count.
    pub fn new(desc: TensorDescriptor, data: Vec<f32>) -> Self {
        assert_eq!(
            desc.num_elements(),
            data.len(),
            "descriptor {:?} is incompatible with {} data elements",
            desc.dims(),
            data.len()
        );
        Self { desc, data, mem: None, buf: None }
    }

    /// Creates a zero-filled tensor.
    pub fn zeros(desc: TensorDescriptor) -> Self {
        let n = desc.num_elements();
        Self { desc, data: vec![0.0; n], mem: None, buf: None }
    }

    /// Logical descriptor.
    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    /// Replaces the descriptor, resizing the host payload to match and
    /// invalidating any device-side mirror.
    pub fn resize(&mut self, desc: TensorDescriptor) {
        self.data.resize(desc.num_elements(), 0.0);
        self.desc = desc;
        self.mem = None;
        self.buf = None;
    }

    /// Host data, logical order.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable host data, logical order.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Device memory descriptor, if one has been inferred.
    pub fn device_mem(&self) -> Option<&MemoryDescriptor> {
        self.mem.as_ref()
    }

    /// Installs a freshly inferred device memory descriptor.
    ///
    /// Any previously bound buffer is forgotten: a layout change always
    /// invalidates the device mirror.
    pub fn set_device_mem(&mut self, mem: MemoryDescriptor) {
        self.mem = Some(mem);
        self.buf = None;
    }

    /// Bound device buffer, if any.
    pub fn device_buf(&self) -> Option<BufferId> {
        self.buf
    }

    /// Binds a device buffer that holds this tensor's packed contents.
    pub fn bind_device(&mut self, buf: BufferId) {
        self.buf = Some(buf);
    }

    /// Forgets the device mirror without touching host data.
    pub fn unbind_device(&mut self) -> Option<BufferId> {
        self.buf.take()
    }
}
