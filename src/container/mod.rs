pub mod manager;
pub mod models;
pub mod pool;
pub mod resource_limits;
pub mod runtime;

pub use manager::WorkspaceManager;
pub use models::{
    CleanupReport, EnvPreferences, PaginatedResult, Pagination, WorkspaceFilter, WorkspaceRecord,
    WorkspaceSpec, WorkspaceStatus,
};
pub use pool::{PoolConfig, PooledContainer, WarmPool};
pub use resource_limits::ResourceLimits;
pub use runtime::{ContainerRuntime, DockerRuntime};
