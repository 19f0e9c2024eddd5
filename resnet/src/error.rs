use thiserror::Error;

/// The error type for backbone construction.
///
/// Construction is the only fallible surface of this crate: once a backbone
/// is built, its forward passes are infallible.
#[derive(Error, Debug)]
pub enum BackboneError {
    /// Error for when configuration parameters are logically inconsistent.
    #[error("Invalid backbone configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when a feature is requested at a depth that cannot carry it.
    ///
    /// Deformable convolutions, non-local blocks, squeeze-excitation and
    /// global-context blocks attach to bottleneck blocks, which only exist
    /// at depths >= 50.
    #[error("{feature} requires bottleneck blocks, not available at depth {depth}")]
    UnsupportedForDepth {
        /// The name of the unsupported feature.
        feature: String,
        /// The configured network depth.
        depth: usize,
    },
}

/// A specialized `Result` type for backbone construction.
pub type BackboneResult<T> = Result<T, BackboneError>;
