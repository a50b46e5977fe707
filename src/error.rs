//! Error types for the capture control plane

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared control block errors
#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Invalid shared memory name: {0}")]
    InvalidName(String),

    #[error("Failed to open shared memory {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to map shared memory {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Shared memory {name} is {actual} bytes, expected at least {expected}")]
    TooSmall {
        name: String,
        actual: usize,
        expected: usize,
    },

    #[error("Shared memory {name} has foreign layout (magic {magic:#010x}, version {version})")]
    LayoutMismatch { name: String, magic: u32, version: u32 },

    #[error("Tap capacity {0} does not fit the mapped region")]
    InvalidTapCapacity(usize),
}

/// Worker process errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device list helper returned no output after {0} attempts")]
    EmptyDeviceList(u32),

    #[error("Malformed device list: {0}")]
    MalformedDeviceList(String),

    #[error("Worker driver is shutting down")]
    Closed,
}

/// Session registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Session already registered: {0}")]
    DuplicateSession(u32),

    #[error("Session not found: {0}")]
    UnknownSession(u32),

    #[error("Session position {position} out of range (0..{len})")]
    PositionOutOfRange { position: i64, len: usize },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
