use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcrdError {
    // Configuration errors
    #[error("Invalid progression order")]
    InvalidProgressionOrder = 1,
    #[error("Invalid progression order change record")]
    InvalidProgressionChange = 2,
    #[error("Spatial progression requires power-of-two component subsampling")]
    NonPowerOfTwoSubsampling = 3,
    #[error("Number of quality layers does not match the layer specification")]
    LayerCountMismatch = 4,
    #[error("Non-zero layer size targets must be strictly increasing")]
    NonIncreasingLayerTargets = 5,
    #[error("Layer slope thresholds must be non-increasing")]
    NonMonotonicSlopeThresholds = 6,
    #[error("Not enough coded data to satisfy the requested layer size")]
    InsufficientData = 7,
    #[error("Invalid rate tolerance")]
    InvalidRateTolerance = 8,
    #[error("Invalid bit-rate specification")]
    InvalidRate = 9,
    #[error("Invalid codestream geometry")]
    InvalidGeometry = 10,

    // Block coder contract violations
    #[error("Empty truncation point table")]
    EmptyTruncationTable = 20,
    #[error("Invalid truncation point table")]
    InvalidTruncationTable = 21,
    #[error("Subband count does not match resolution level")]
    SubbandCountMismatch = 22,

    // Logic errors
    #[error("Invalid operation")]
    InvalidOperation = 100,
    #[error("Invalid argument")]
    InvalidArgument = 101,
    #[error("Invalid precinct reference")]
    InvalidPrecinctReference = 102,
    #[error("Precinct code-blocks already submitted")]
    PrecinctAlreadySubmitted = 103,
    #[error("Progression does not cover every packet of the tile")]
    IncompleteProgression = 104,
}

impl PcrdError {
    /// True for errors caused by the caller's configuration rather than a
    /// broken internal contract.
    pub fn is_configuration_error(self) -> bool {
        (self as u32) < 20
    }
}
