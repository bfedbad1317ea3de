//! Isolated execution of generated analysis code.
//!
//! # Architecture
//! ```text
//! ┌──────────────────┐  screen   ┌──────────────────────────────┐
//! │ CodeGeneration   │──────────▶│ ProcessSandbox               │
//! │ sub-agent        │           │  tempdir/                    │
//! └──────────────────┘           │   ├── dataset.json           │
//!          ▲                     │   └── analysis.py            │
//!          │  stdout | error     │  prlimit --as .. --          │
//!          │                     │  bwrap --unshare-all         │
//!          │                     │    --bind tempdir /work --   │
//!          └─────────────────────│  python3 -I analysis.py      │
//!                                └──────────────────────────────┘
//! ```
//!
//! Code runs in a separate OS process with an empty environment and a
//! wall-clock timeout. With isolation on it lives in fresh namespaces that
//! mount only the read-only system directories and the scratch directory
//! holding the dataset, with no network. Missing launchers make the sandbox
//! unavailable rather than weaker. Output is read up to the configured cap
//! and the process is killed past it.

pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::SandboxConfig;
use crate::dataset::Dataset;

pub use process::ProcessSandbox;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("execution failed: {0}")]
    Exception(String),

    #[error("disallowed operation: {0}")]
    Disallowed(String),

    /// The sandbox itself could not be started.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

impl SandboxError {
    /// Failures attributable to the generated code.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SandboxError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub max_output_bytes: usize,
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            memory_mb: config.memory_mb,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    /// stdout exceeded the output limit and was cut.
    pub truncated: bool,
    pub duration_ms: u64,
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(&self, code: &str, dataset: &Dataset, limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError>;
}
