use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process: {0}")]
    ProcessOpenFailed(String),

    #[error("No process attached")]
    ProcessNotAttached,

    #[error("Module not loaded: {0}")]
    ModuleNotFound(String),

    #[error("Dereferenced a null pointer at address {address:#x}")]
    NullPointer { address: u64 },

    #[error("Malformed pointer chain: {0}")]
    InvalidChain(String),

    #[error("Failed to read process memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: u64, message: String },

    #[error("Failed to allocate {size} bytes in target process: {message}")]
    AllocationFailed { size: usize, message: String },

    #[error("Failed to free memory at address {address:#x}: {message}")]
    FreeFailed { address: u64, message: String },

    #[error("Generated code needs {required} bytes but only {available} are available")]
    PatchSpaceOverflow { required: usize, available: usize },

    #[error("Cannot relocate instruction: {0}")]
    RelocationUnsupported(String),

    #[error("Relative writes are not supported for {0}")]
    RelativeWriteUnsupported(&'static str),

    #[error("Effect flag lane {0} is out of range (0..=30)")]
    FlagLaneOutOfRange(u8),

    #[error("Invalid byte pattern: {0}")]
    InvalidPattern(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures that are expected during attach/teardown races and
    /// should be retried rather than treated as fatal.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            Error::ProcessNotFound(_)
                | Error::ProcessNotAttached
                | Error::ModuleNotFound(_)
                | Error::NullPointer { .. }
                | Error::MemoryReadFailed { .. }
        )
    }
}
