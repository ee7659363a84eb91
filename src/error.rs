use thiserror::Error;

/// Errors reported by sketch construction, merging, querying and decoding.
#[derive(Debug, Error)]
pub enum SketchError {
    /// Invalid construction parameter (error rate, derived precision, minhash capacity, window)
    /// or an operation requiring a component the sketch was built without.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Sketches built with different precision can not be merged or compared.
    #[error("precision mismatch: expected {expected}, found {found}")]
    PrecisionMismatch { expected: u8, found: u8 },

    /// Sliding window query outside of `(0, configured]`.
    #[error("window {requested} is outside of (0, {configured}]")]
    WindowRange { requested: f64, configured: f64 },

    /// Rank suffix wider than the register width, i.e. hash width and precision disagree.
    #[error("rank overflow: suffix of {bit_length} bits does not fit into {max_width} bits")]
    Overflow { bit_length: u32, max_width: u32 },

    /// Jaccard index requested over an empty sample set.
    #[error("jaccard index is undefined over empty sample sets")]
    EmptySet,

    /// Encoding or decoding through the byte codec failed.
    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    /// Compression stream failure.
    #[error("compression failure: {0}")]
    Io(#[from] std::io::Error),

    /// Decoded state violates a sketch invariant.
    #[error("corrupt sketch state: {0}")]
    CorruptState(String),
}

impl SketchError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        SketchError::Configuration(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        SketchError::CorruptState(msg.into())
    }
}
