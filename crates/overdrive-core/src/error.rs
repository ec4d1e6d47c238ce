use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address for offset {offset:#x} could not be resolved: {reason}")]
    UnresolvedAddress { offset: u32, reason: String },

    #[error("Value at {address:#x} does not match expected default {expected} ({label})")]
    ValidationMismatch {
        address: usize,
        expected: f64,
        label: String,
    },

    #[error("Failed to change page protection at {address:#x}: {message}")]
    ProtectionFailure { address: usize, message: String },

    #[error("Import {module}!{function} not found")]
    HookTargetNotFound { module: String, function: String },

    #[error("Failed to reserve {capacity} bytes for the pool: {message}")]
    PoolReservation { capacity: usize, message: String },

    #[error("Read of {len} bytes at {address:#x} is outside the image")]
    OutOfBounds { address: usize, len: usize },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Errors that only disable one feature and never abort initialization.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::PoolReservation { .. })
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
