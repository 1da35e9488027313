//! Error types for Tandem

use thiserror::Error;

/// Main error type for Tandem operations
///
/// Variants fall into the groups the coordinator reasons about:
/// connection problems, packaging problems, verification problems,
/// caller contract violations, and persistence failures.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Device id is not present in the registry
    #[error("Device not paired: {0}")]
    DeviceNotPaired(String),

    /// Session id is unknown to the session manager
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A session against this device is already in flight
    #[error("Sync already in progress for device: {0}")]
    SessionAlreadyActive(String),

    /// No adapter is registered for the requested transport kind
    #[error("No transport adapter for {0}")]
    UnsupportedTransport(String),

    /// Remote side refused the pairing handshake
    #[error("Pairing refused: {0}")]
    PairingRefused(String),

    /// Remote device could not be reached or dropped the channel
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded wait expired
    #[error("Timed out while {0}")]
    Timeout(String),

    /// Container bytes could not be parsed
    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    /// Container format version not supported
    #[error("Package version {0} is not supported")]
    PackageVersionUnsupported(u8),

    /// Decryption failed (wrong secret, tampered data, or tampered metadata)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Decoded payload does not match what the metadata declares
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    /// Cryptographic operation failed outside decryption
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Remote acknowledgement does not match what was sent
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// A domain provider could not produce or apply its blob
    #[error("Domain provider error: {0}")]
    Provider(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Remote unreachable, handshake refused, or a bounded wait expired.
    ///
    /// These are never retried inside a session; the scheduler's next
    /// trigger is the retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::Timeout(_) | SyncError::PairingRefused(_)
        )
    }

    /// Container, decryption, or schema problems. Always fatal to a session.
    pub fn is_packaging_error(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedPackage(_)
                | SyncError::PackageVersionUnsupported(_)
                | SyncError::DecryptionFailed(_)
                | SyncError::SchemaValidation(_)
        )
    }

    /// Acknowledgement mismatch after transfer.
    pub fn is_verification_error(&self) -> bool {
        matches!(self, SyncError::VerificationFailed(_))
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
