use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkdenError>;

#[derive(Error, Debug)]
pub enum WorkdenError {
    #[error("workspace not found: {0}")]
    NotFound(String),

    #[error("workspace name '{name}' already in use by owner {owner_id}")]
    DuplicateName { owner_id: String, name: String },

    #[error("no free host port in range {base}..{end}")]
    PortExhausted { base: u16, end: u16 },

    #[error("container runtime operation failed: {0}")]
    Runtime(String),

    #[error("circuit breaker '{dependency}' is open")]
    CircuitOpen { dependency: String },

    #[error("persistent store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("workspace failed to start: {0}")]
    StartFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkdenError {
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<bollard::errors::Error> for WorkdenError {
    fn from(e: bollard::errors::Error) -> Self {
        Self::Runtime(e.to_string())
    }
}
