// Error types for everything that can fail outside of a check-in attempt.
//
// Check-in attempts themselves never error (they always resolve to a
// CheckInResult), so nothing in here is about the server's status codes.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request to {path} failed: {source}")]
    Request {
        path: String,
        source: reqwest::Error,
    },

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("{path} answered with status {status}")]
    Status { path: String, status: u16 },

    #[error("Invalid request body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Stored data at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: bincode::Error,
    },
}

#[derive(Debug, Error)]
pub enum IdentityError {
    // Never replaced by a random value, the caller has to treat the device as unidentified.
    #[error("Device fingerprint unavailable: {0}")]
    Unavailable(String),

    #[error("Fingerprint cache error: {0}")]
    Cache(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Could not access camera: {0}")]
    Device(String),

    #[error("Recording produced {found}, expected {expected}")]
    UnsupportedContainer {
        expected: &'static str,
        found: String,
    },

    #[error("Nothing was recorded")]
    Empty,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unexpected response ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("This kiosk is not logged in as an admin")]
    NotAdmin,

    #[error("This kiosk is not teacher monitored")]
    NotTeacherMonitored,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Wrong admin password")]
    LoginRejected,

    #[error("No video found for {email} in {block} block")]
    NoVideo { block: String, email: String },
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Not a student id or email address")]
    Malformed,

    #[error("There is no user with email or student id {0}")]
    UnknownStudent(String),

    #[error("Student id lookups are over quota right now, use your email instead")]
    QuotaExceeded,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Couldn't save identity: {0}")]
    Store(#[from] StoreError),
}
