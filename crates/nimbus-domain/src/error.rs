use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("invalid short id: {0:?}")]
    InvalidShortId(String),

    #[error("invalid device message: {0}")]
    InvalidMessage(String),

    #[error("certificate provisioning failed for {device_id}: {reason}")]
    Provisioning { device_id: String, reason: String },

    #[error("association failed for {device_id}: {reason}")]
    Association { device_id: String, reason: String },

    #[error("registration failed for {short_id}: {reason}")]
    Registration { short_id: String, reason: String },

    #[error("cloud API request failed: {0}")]
    CloudApi(String),

    #[error("cloud link error: {0}")]
    Link(String),

    #[error("cell geolocation not found: {0}")]
    CellLocationNotFound(String),

    #[error("cell geolocation lookup failed: {0}")]
    CellLocation(String),

    #[error("device store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
