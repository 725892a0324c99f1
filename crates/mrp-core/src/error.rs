//! Error types for the MediaRemote client.

use thiserror::Error;

/// Primary error type for all MediaRemote operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("No response within the deadline")]
    Timeout,

    #[error("Connection closed")]
    ClosedConnection,

    #[error("Usage error: {0}")]
    Usage(&'static str),
}

/// Errors decoding inbound frames.
///
/// Decode failures are not fatal to the connection: the frame is dropped
/// and the session continues.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed protobuf envelope: {0}")]
    Envelope(String),

    #[error("Frame length prefix is malformed")]
    BadLengthPrefix,

    #[error("Frame exceeds maximum length: {0} bytes")]
    Oversize(usize),
}

/// Authentication failures.
///
/// Any of these aborts the in-flight pairing/verify exchange and closes
/// the connection.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("SRP proof mismatch")]
    ProofMismatch,

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("AEAD tag mismatch")]
    TagMismatch,

    #[error("Peer identifier mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    #[error("Device rejected the exchange (error code {0:#04x})")]
    Rejected(u8),
}

/// Errors in a pairing or verify exchange.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("Unexpected sequence number: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Missing pairing TLV tag: {0:#04x}")]
    MissingTag(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
}

/// Parsing errors for credentials, TLVs and service records.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid hex value: {0}")]
    InvalidHex(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let auth_err = Error::Auth(AuthError::ProofMismatch);
        assert!(auth_err.to_string().contains("Authentication error"));
        assert!(auth_err.to_string().contains("SRP proof mismatch"));

        let seq_err = Error::Pairing(PairingError::SequenceMismatch {
            expected: 2,
            actual: 4,
        });
        assert!(seq_err.to_string().contains("expected 2"));
        assert!(seq_err.to_string().contains("got 4"));

        let timeout_err = Error::Timeout;
        assert!(timeout_err.to_string().contains("deadline"));

        let usage_err = Error::Usage("connection not open");
        assert!(usage_err.to_string().contains("connection not open"));
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error as StdError;

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "test");
        let err = Error::Io(io_err);
        assert!(err.source().is_some());

        let err = Error::Decode(DecodeError::Envelope("bad varint".into()));
        assert!(err.source().is_some());
    }

    #[test]
    fn error_conversions() {
        let err: Error = AuthError::TagMismatch.into();
        assert!(matches!(err, Error::Auth(_)));

        let err: Error = PairingError::InvalidState("test".into()).into();
        assert!(matches!(err, Error::Pairing(_)));

        let err: Error = CryptoError::Decryption("tag".into()).into();
        assert!(matches!(err, Error::Crypto(_)));

        let err: Error = ParseError::MissingField("port").into();
        assert!(matches!(err, Error::Parse(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
