use crate::domain::ids::CorrelationToken;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Gateway error: {0}")]
    Gateway(#[from] crate::domain::gateway::GatewayError),
    #[error("Collection {token} never reached the gateway: {source}")]
    CollectionNotSent {
        token: CorrelationToken,
        #[source]
        source: crate::domain::gateway::GatewayError,
    },
    #[error("Duplicate correlation token: {0}")]
    DuplicateCorrelation(String),
    #[error("Receipt {0} is already recorded against another payment")]
    DuplicateReceipt(String),
    #[error("Payment {0} is already claimed by settlement batch {1}")]
    AlreadyClaimed(String, String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Settlement period {0} has not closed yet")]
    PeriodNotClosed(String),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Storage conflict: {0}")]
    Conflict(String),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, PaymentError>;
