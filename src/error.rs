//! Error types for the runtime
//!
//! Geometry and timing code never produces these; they degrade to empty
//! meshes, identity matrices or clamped values instead. Errors are reserved
//! for handle misuse, bad configuration and device loss.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VrError {
    #[error("invalid or destroyed handle")]
    InvalidHandle,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("display device lost: {0}")]
    DeviceLost(String),
    #[error("gpu error: {0}")]
    Gpu(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VrError {
    /// Device loss means every GPU resource must be recreated.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, VrError::DeviceLost(_))
    }
}

pub type VrResult<T> = Result<T, VrError>;
