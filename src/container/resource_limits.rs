use serde::{Deserialize, Serialize};

/// Docker expresses CPU ceilings as quota microseconds per scheduling
/// period; 100_000 = one full core.
pub const CPU_PERIOD_USECS: i64 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: CpuLimits,
    pub memory: MemoryLimits,
    pub disk: DiskLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuLimits {
    pub cores: f64,
    pub shares: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub limit_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskLimits {
    pub limit_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: CpuLimits {
                cores: 1.0,
                shares: Some(1024),
            },
            memory: MemoryLimits { limit_mb: 512 },
            disk: DiskLimits { limit_mb: 2048 },
        }
    }
}

impl CpuLimits {
    /// CPU quota in microseconds per `CPU_PERIOD_USECS` period.
    pub fn quota_usecs(&self) -> i64 {
        (self.cores * CPU_PERIOD_USECS as f64) as i64
    }
}

impl MemoryLimits {
    pub fn bytes(&self) -> i64 {
        self.limit_mb as i64 * 1024 * 1024
    }
}

impl DiskLimits {
    pub fn bytes(&self) -> i64 {
        self.limit_mb as i64 * 1024 * 1024
    }
}
