//! Failure taxonomy shared by every operator phase.
//!
//! Shape, layout, and arity violations are checked eagerly at each phase
//! boundary and returned to the caller immediately; they are never silently
//! coerced. Per-candidate failures inside autotuning are recovered locally
//! (the candidate is dropped and the search continues) and only escalate to
//! [`Error::NoViableConfiguration`] once the candidate set is exhausted with
//! zero successes. Nothing in this crate is fatal to the process.

use core::fmt;

/// Errors returned by descriptor inference, validation, tuning and execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required operand, output slot, or device handle is absent.
    NullArgument,
    /// Operand slice counts disagree (weights/biases/outputs), or a slice
    /// count is unsupported on this path.
    ArityMismatch,
    /// Operand ranks or extents are inconsistent.
    ShapeMismatch,
    /// The tensor layout or device buffer packing is not one the backend
    /// accepts.
    UnsupportedLayout,
    /// No kernel exists for this element datatype on this backend.
    UnsupportedDatatype,
    /// The output-extent rounding mode is not recognized.
    UnsupportedRoundingMode,
    /// Every kernel configuration candidate failed sizing or execution.
    NoViableConfiguration,
    /// The device runtime reported a failure.
    Device(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullArgument => write!(f, "required operand is absent"),
            Self::ArityMismatch => write!(f, "operand counts do not match"),
            Self::ShapeMismatch => write!(f, "operand shapes are inconsistent"),
            Self::UnsupportedLayout => write!(f, "unsupported tensor or buffer layout"),
            Self::UnsupportedDatatype => write!(f, "unsupported element datatype"),
            Self::UnsupportedRoundingMode => write!(f, "unsupported rounding mode"),
            Self::NoViableConfiguration => {
                write!(f, "no kernel configuration survived sizing and benchmarking")
            }
            Self::Device(msg) => write!(f, "device failure: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
