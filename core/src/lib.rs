pub mod error;
pub mod tensor;
pub mod banded;
pub mod config;
pub mod recurrence;
pub mod dense;
pub mod objective;
#[cfg(feature = "internal")]
pub mod gradient;
#[cfg(not(feature = "internal"))]
pub(crate) mod gradient;

// Wengert tape AD: the banded update is an opaque primitive with a
// hand-derived backward, everything else uses the tape's standard ops.
pub mod tape;
pub mod opaque_adapters;
pub mod traced_forward;

pub use banded::{BandedOperator, BandedPullback};
pub use config::RecurrenceConfig;
pub use error::{BandError, Result, StructuralParam};
pub use objective::{DiffTarget, Objective};
pub use recurrence::RecurrenceEngine;
pub use tensor::Matrix;
