//! edgerun: an on-device tensor inference core.
//!
//! Executes neural-network operators across heterogeneous compute backends
//! (generic CPU, SIMD CPU, GPU) with layout-specialized kernels. Every
//! operator follows the same four-phase contract:
//!
//! 1. `infer_output_size` — shape inference and, on the GPU, device memory
//!    descriptor inference
//! 2. `infer_forward_algorithm` — kernel configuration selection; on the GPU
//!    this benchmarks candidate configurations on the real device and caches
//!    the fastest
//! 3. `infer_forward_tmp_bytes` — scratch-buffer sizing for the selected
//!    configuration
//! 4. `execute` — validated dispatch to the concrete kernel
//!
//! Callers invoke the phases in that order exactly once per unique input
//! shape, then call `execute` repeatedly.
//!
//! # Modules
//!
//! - [`backend`] — compute backend selection from runtime architecture info.
//! - [`desc`] — tensor and device-memory descriptors plus the layout algebra.
//! - [`tensor`] — host tensors with optional device residency.
//! - [`device`] — the device/runtime handle abstraction (buffers, queue,
//!   profiling).
//! - [`ops`] — the operators, their CPU kernels, and the GPU candidate
//!   generation + autotuning machinery.
//! - [`error`] — the failure taxonomy shared by every phase.
//!
//! # Feature Flags
//!
//! - `simd` — vectorized CPU kernel variants
//! - `wgpu` — the `wgpu`-backed GPU device implementation

pub mod approx;
pub mod backend;
pub mod desc;
pub mod device;
pub mod error;
pub mod ops;
pub mod tensor;
