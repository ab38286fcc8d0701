pub mod audit;
pub mod config;
pub mod container;
pub mod database;
pub mod error;
pub mod recovery;

pub use config::Config;
pub use container::manager::WorkspaceManager;
pub use container::pool::WarmPool;
pub use container::runtime::{ContainerRuntime, DockerRuntime};
pub use database::{SqliteStore, WorkspaceStore};
pub use error::{Result, WorkdenError};
pub use recovery::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
