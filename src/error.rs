use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced by the reconciliation service.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} is not configured on this server")]
    Disabled(&'static str),

    /// An external collaborator (nginx, certbot, mysql, docker, Cloudflare) failed.
    #[error("{0}")]
    System(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, PanelError>;
