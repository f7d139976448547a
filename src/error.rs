//! Error types shared by the orchestrator, the daemon and the transport layers
//!
//! Every failure carries enough context (operation name, device id) to be
//! reported back over the control plane as a `{code, message}` pair.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level status code carried in every control-plane response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const PARAM_INVALID: ErrorCode = ErrorCode(1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(2);
    pub const TRANSPORT_ERROR: ErrorCode = ErrorCode(3);
    pub const AUTH_FAILED: ErrorCode = ErrorCode(4);
    pub const PROCESS_ERROR: ErrorCode = ErrorCode(5);
    pub const TIMEOUT: ErrorCode = ErrorCode(6);
    pub const NOT_FOUND: ErrorCode = ErrorCode(7);
    pub const CONFIG_ERROR: ErrorCode = ErrorCode(8);
    pub const FAILED: ErrorCode = ErrorCode(9);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Symbolic name used in log lines
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "SUCCESS",
            1 => "PARAM_INVALID",
            2 => "INTERNAL_ERROR",
            3 => "TRANSPORT_ERROR",
            4 => "AUTH_FAILED",
            5 => "PROCESS_ERROR",
            6 => "TIMEOUT",
            7 => "NOT_FOUND",
            8 => "CONFIG_ERROR",
            _ => "FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Transport error in {op} on device {device}: {message}")]
    Transport {
        op: &'static str,
        device: i32,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Partial deployment failure: {0}")]
    PartialDeployment(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl DeployError {
    pub fn transport(op: &'static str, device: i32, message: impl Into<String>) -> Self {
        DeployError::Transport {
            op,
            device,
            message: message.into(),
        }
    }

    /// Rebuild an error from a `{code, message}` pair received over the wire
    pub fn from_wire(code: ErrorCode, message: impl Into<String>) -> Self {
        DeployError::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DeployError::Config(_) | DeployError::Json(_) => ErrorCode::CONFIG_ERROR,
            DeployError::InvalidParam(_) => ErrorCode::PARAM_INVALID,
            DeployError::Internal(_) | DeployError::Codec(_) => ErrorCode::INTERNAL_ERROR,
            DeployError::Transport { .. } | DeployError::Io(_) => ErrorCode::TRANSPORT_ERROR,
            DeployError::Auth(_) => ErrorCode::AUTH_FAILED,
            DeployError::Process(_) => ErrorCode::PROCESS_ERROR,
            DeployError::Timeout(_) => ErrorCode::TIMEOUT,
            DeployError::NotFound(_) => ErrorCode::NOT_FOUND,
            DeployError::PartialDeployment(_) => ErrorCode::FAILED,
            DeployError::Remote { code, .. } => *code,
        }
    }
}

/// Map a poisoned lock into an internal error instead of panicking
pub(crate) fn lock_poisoned<T>(what: &str) -> impl FnOnce(T) -> DeployError + '_ {
    move |_| DeployError::Internal(format!("{} lock poisoned", what))
}

pub type Result<T> = std::result::Result<T, DeployError>;
