//! Error types for Streamgate
//!
//! This module defines the main error types used throughout the proxy and
//! provides mapping to Kafka protocol error codes so that per-request
//! failures can be answered with a response the client understands.

use thiserror::Error;

mod kafka_error_code;

pub use kafka_error_code::KafkaErrorCode;

/// Result type alias for Streamgate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Main error type for Streamgate
#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("No virtual cluster binding: {0}")]
    NoBinding(String),

    #[error("Filter chain error: {0}")]
    FilterChain(String),

    #[error("Invalid filter declaration: {0}")]
    FilterConstruction(String),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("KMS error: {0}")]
    Kms(#[from] KmsError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("Connection idle timeout")]
    IdleTimeout,
}

impl GateError {
    /// Create a protocol error with a message
    pub fn protocol_msg(msg: impl Into<String>) -> Self {
        GateError::Protocol(msg.into())
    }

    /// Map this error to the Kafka error code that should be reported to the
    /// client when the failure is scoped to a single request.
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            GateError::Io(_) | GateError::Upstream(_) => KafkaErrorCode::NetworkException,
            GateError::Protocol(_) => KafkaErrorCode::CorruptMessage,
            GateError::AuthenticationFailed(_) => KafkaErrorCode::SaslAuthenticationFailed,
            GateError::Encryption(e) => e.kafka_error_code(),
            GateError::Kms(_) => KafkaErrorCode::UnknownServerError,
            GateError::ShuttingDown => KafkaErrorCode::BrokerNotAvailable,
            GateError::IdleTimeout => KafkaErrorCode::RequestTimedOut,
            _ => KafkaErrorCode::UnknownServerError,
        }
    }
}

/// Errors produced by the envelope-encryption filter and its key manager.
///
/// Cloneable because loading-cache waiters coalesced onto a single failed
/// KMS load all observe the same error.
#[derive(Error, Debug, Clone)]
pub enum EncryptionError {
    /// The DEK lease could not be reserved within the retry budget.
    #[error("request not satisfiable: {0}")]
    RequestNotSatisfiable(String),

    /// Header encryption was requested for a record with a null value.
    /// The null value must be preserved for log-compaction tombstoning.
    #[error("cannot encrypt headers of a tombstone record in {topic}-{partition}")]
    HeaderEncryptionOnTombstone { topic: String, partition: i32 },

    /// AEAD tag verification failed for a single record.
    #[error("integrity check failed for record at offset {offset}")]
    IntegrityFailure { offset: i64 },

    #[error("invalid encryption header on record at offset {offset}: {reason}")]
    InvalidEncryptionHeader { offset: i64, reason: String },

    #[error("unknown encryption version {0}")]
    UnknownEncryptionVersion(u8),

    #[error("unknown wrapper aad code {0}")]
    UnknownAad(u8),

    #[error("unknown wrapper cipher code {0}")]
    UnknownCipher(u8),

    #[error("truncated wrapper or parcel: {0}")]
    Truncated(String),

    #[error("record batch codec error: {0}")]
    BatchCodec(String),

    #[error("record batch magic {0} is not supported for encryption")]
    UnsupportedMagic(i8),

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("KMS failure: {0}")]
    Kms(String),
}

impl EncryptionError {
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            EncryptionError::RequestNotSatisfiable(_) => KafkaErrorCode::PolicyViolation,
            EncryptionError::HeaderEncryptionOnTombstone { .. } => KafkaErrorCode::InvalidRecord,
            EncryptionError::IntegrityFailure { .. } => KafkaErrorCode::CorruptMessage,
            _ => KafkaErrorCode::UnknownServerError,
        }
    }
}

/// Errors surfaced by a KMS implementation.
#[derive(Error, Debug, Clone)]
pub enum KmsError {
    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("unknown alias: {0}")]
    UnknownAlias(String),

    #[error("invalid EDEK: {0}")]
    InvalidEdek(String),

    #[error("KMS unavailable: {0}")]
    Unavailable(String),
}

impl From<KmsError> for EncryptionError {
    fn from(e: KmsError) -> Self {
        EncryptionError::Kms(e.to_string())
    }
}
