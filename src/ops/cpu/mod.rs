//! CPU backend kernels.
//!
//! Reference implementations of the operator contracts, in two flavours:
//!
//! - `*_general` — portable scalar loops, the correctness baseline every
//!   other backend is compared against
//! - `*_simd` — rayon-parallel, lane-chunked variants; with the `simd`
//!   feature on an AVX2 target the hot loops use vector intrinsics
//!
//! Both flavours are layout-native (plain NCHW / MKT host order), so the
//! CPU scratch contract is zero bytes.

pub mod fully_connected;
pub mod pooling;
