//! Backend selection module.
//!
//! This module defines the available compute backends and provides functions
//! to set and get the backend used for operator dispatch.
//!
//! # Supported Backends
//!
//! - `CpuGeneral` — portable scalar CPU kernels (default).
//! - `CpuSimd` — vectorized CPU kernels (requires the `simd` feature and a
//!   capable CPU).
//! - `Gpu` — device kernels driven through a [`crate::device::Device`]
//!   handle.
//!
//! The backend is stored globally using an `AtomicU8`, enabling fast
//! switching between backends at runtime. It is chosen once per run, either
//! explicitly or via [`detect`].

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported compute backends.
///
/// Closed set: dispatch sites match on this tag, so adding a backend means
/// adding a variant and one arm per dispatch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Arch {
    /// Portable scalar CPU kernels (default).
    #[default]
    CpuGeneral = 0,
    /// Vectorized CPU kernels.
    CpuSimd = 1,
    /// GPU kernels driven through a device handle.
    Gpu = 2,
}

impl TryFrom<u8> for Arch {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::CpuGeneral),
            1 => Ok(Self::CpuSimd),
            2 => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

/// Internal global state for the active backend.
///
/// Relaxed switching is fine here: the backend is expected to change rarely
/// and never concurrently with in-flight operator calls.
static GLOBAL_DEFAULT_ARCH: AtomicU8 = AtomicU8::new(Arch::CpuGeneral as u8);

/// Sets the active backend used for operator dispatch.
///
/// # Example
///
/// ```
/// use edgerun::backend::{set_arch, Arch};
/// set_arch(Arch::CpuGeneral);
/// ```
pub fn set_arch(a: Arch) {
    GLOBAL_DEFAULT_ARCH.store(a as u8, Ordering::Release);
}

/// Returns the currently active backend.
///
/// If the stored value is invalid, defaults to [`Arch::CpuGeneral`].
pub fn get_arch() -> Arch {
    Arch::try_from(GLOBAL_DEFAULT_ARCH.load(Ordering::Acquire)).unwrap_or_default()
}

/// Picks the best CPU backend from runtime architecture info.
///
/// Returns [`Arch::CpuSimd`] when the `simd` feature is enabled and the
/// running CPU supports the required vector extensions, otherwise
/// [`Arch::CpuGeneral`]. The GPU backend is never auto-detected: it requires
/// a device handle, so callers opt in by constructing one and passing
/// [`Arch::Gpu`] to [`set_arch`].
pub fn detect() -> Arch {
    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        // NEON is baseline on aarch64.
        log::debug!("aarch64 target, selecting SIMD CPU backend");
        Arch::CpuSimd
    }
    #[cfg(not(all(feature = "simd", target_arch = "aarch64")))]
    {
        #[cfg(all(feature = "simd", target_arch = "x86_64"))]
        if is_x86_feature_detected!("avx2") {
            log::debug!("detected avx2, selecting SIMD CPU backend");
            return Arch::CpuSimd;
        }
        log::debug!("selecting general CPU backend");
        Arch::CpuGeneral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_set_get() {
        let prev = get_arch();
        set_arch(Arch::Gpu);
        assert_eq!(get_arch(), Arch::Gpu);
        set_arch(prev);
    }

    #[test]
    fn invalid_tag_defaults_to_cpu() {
        assert_eq!(Arch::try_from(9), Err(()));
    }
}
