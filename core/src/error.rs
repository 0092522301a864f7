//! Error types for the bandgrad-core crate.

/// Structural parameters of the recurrence. None of them carry a gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StructuralParam {
    /// Band half-width `m`.
    BandWidth,
    /// State dimension `n`.
    StateDim,
    /// Number of time steps `T`.
    Horizon,
}

impl std::fmt::Display for StructuralParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralParam::BandWidth => write!(f, "band width"),
            StructuralParam::StateDim => write!(f, "state dimension"),
            StructuralParam::Horizon => write!(f, "time horizon"),
        }
    }
}

/// Error type for all fallible operations in the bandgrad-core crate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BandError {
    /// Returned when the band half-width is zero.
    #[error("band width must be >= 1, got {m}")]
    InvalidBandWidth {
        /// The invalid band width.
        m: usize,
    },

    /// Returned when the state dimension is zero.
    #[error("state dimension must be >= 1, got {n}")]
    InvalidStateDim {
        /// The invalid dimension.
        n: usize,
    },

    /// Returned when the input sequence has no time steps.
    #[error("input sequence must have at least one column")]
    EmptyHorizon,

    /// Returned when a flat buffer does not match the declared shape.
    #[error("buffer of length {len} does not match shape {rows}x{cols}")]
    ShapeMismatch {
        /// Length of the provided buffer.
        len: usize,
        /// Declared row count.
        rows: usize,
        /// Declared column count.
        cols: usize,
    },

    /// Returned when a state vector length differs from the operator dimension.
    #[error("state length {len} does not match operator dimension {n}")]
    StateLengthMismatch {
        /// Length of the provided state.
        len: usize,
        /// Operator dimension.
        n: usize,
    },

    /// Returned when the readout coordinate lies outside the state.
    #[error("readout coordinate {index} out of range for dimension {n}")]
    ReadoutOutOfRange {
        /// Requested coordinate.
        index: usize,
        /// State dimension.
        n: usize,
    },

    /// Returned when a gradient is requested for a structural parameter.
    #[error("cannot differentiate with respect to the {param}: it is structural")]
    UnsupportedDifferentiation {
        /// The parameter the caller asked about.
        param: StructuralParam,
    },

    /// Returned when integer arithmetic leaves the range of the element type.
    /// Step t is the update producing state_t; a lone operator application
    /// counts as step 1.
    #[error("arithmetic overflow at step {step}")]
    Overflow {
        /// Step whose update did not fit.
        step: usize,
    },

    /// Returned when a configuration file cannot be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl BandError {
    /// True for every shape-validation failure raised before computation.
    pub fn is_invalid_shape(&self) -> bool {
        matches!(
            self,
            BandError::InvalidBandWidth { .. }
                | BandError::InvalidStateDim { .. }
                | BandError::EmptyHorizon
                | BandError::ShapeMismatch { .. }
                | BandError::StateLengthMismatch { .. }
                | BandError::ReadoutOutOfRange { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BandError>;
