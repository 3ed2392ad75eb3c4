use std::fmt;
use thiserror::Error;

/// Request outcome surfaced to callers, each variant tied to one status code.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed body, bad parameters, unknown language or missing records.
    #[error("{0}")]
    Input(String),
    /// Targeting rules made the request ineligible.
    #[error("{0}")]
    Rejected(String),
    /// Inactive config, broken code or a bad secret.
    #[error("{0}")]
    Forbidden(String),
    /// The guest script failed to parse, raised or timed out.
    #[error("{0}")]
    Execution(String),
    /// Detail is logged when built through [`DispatchError::internal`] and
    /// never shown to callers.
    #[error("internal error")]
    Internal(String),
}

impl DispatchError {
    pub fn internal(detail: impl fmt::Display) -> Self {
        let detail = detail.to_string();
        log::error!("internal error: {}", detail);
        DispatchError::Internal(detail)
    }

    pub fn status(&self) -> u16 {
        match self {
            DispatchError::Input(_)
            | DispatchError::Rejected(_)
            | DispatchError::Execution(_) => 400,
            DispatchError::Forbidden(_) => 403,
            DispatchError::Internal(_) => 500,
        }
    }
}
