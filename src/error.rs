pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    General(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("grid position {grid_position:?} is outside of dataset dimensions {dimensions:?}")]
    OutOfRange {
        grid_position: Vec<u64>,
        dimensions: Vec<u64>,
    },
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("incompatible N5-HDF5 version {found} (this is {expected})")]
    IncompatibleVersion {
        found: semver::Version,
        expected: semver::Version,
    },
    #[error("native error: {0}")]
    Native(String),
    #[error("store is closed")]
    Closed,
    #[error("store is read-only")]
    ReadOnly,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Semver(#[from] semver::Error),
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::Native(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn wrap(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(error))
    }
}
