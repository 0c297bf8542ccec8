//! Typed errors for provisioning and supervision, and their JSON error responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::archive::ArchiveFormat;

/// Why one archive format could not deliver the binary
#[derive(Debug, Error)]
pub enum AttemptFailure {
    /// The blob is not a valid archive of this format
    #[error("not a valid {format} archive: {reason}")]
    Open { format: ArchiveFormat, reason: String },
    /// The archive opened but holds no matching regular file
    #[error("{format} archive has no entry named {binary}")]
    NotFound { format: ArchiveFormat, binary: String },
    /// The archive opened and matched, but copying the entry failed
    #[error("failed to extract from {format} archive: {source}")]
    Io {
        format: ArchiveFormat,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the archive extractor
#[derive(Debug, Error)]
pub enum ExtractError {
    /// No supported format could open the archive
    #[error("failed to extract frpc: unsupported archive format ({})", JoinAttempts(.attempts))]
    UnsupportedFormat { attempts: Vec<AttemptFailure> },
    /// The archive opened but contains no regular file with the expected name
    #[error("{binary} binary not found in archive")]
    BinaryNotFoundInArchive { binary: String },
    /// Reading the archive or writing the install path failed
    #[error("failed to extract frpc: {0}")]
    Io(#[from] std::io::Error),
}

struct JoinAttempts<'a>(&'a [AttemptFailure]);

impl fmt::Display for JoinAttempts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", attempt)?;
        }
        Ok(())
    }
}

/// Errors from release resolution and binary provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Remote endpoint answered with a non-200 status
    #[error("request to {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },
    /// Request could not be sent or the body could not be read
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// Release metadata was not the expected JSON document
    #[error("failed to parse release metadata: {0}")]
    Decode(#[source] serde_json::Error),
    /// No release asset matches this host
    #[error("no matching asset found for {os}/{arch} (looking for {expected})")]
    AssetNotFound {
        os: String,
        arch: String,
        expected: String,
    },
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// The frpc binary is not present at the install path
    #[error("frpc not installed")]
    NotInstalled,
    /// The binary exists but asking it for its version failed
    #[error("failed to get frpc version: {0}")]
    VersionQuery(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Whether this is a network failure (status or transport)
    pub fn is_network(&self) -> bool {
        matches!(self, ProvisionError::HttpStatus { .. } | ProvisionError::Transport { .. })
    }
}

/// Errors from the process supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid server id {0:?}")]
    InvalidServerId(String),
    #[error("server {0} is already running")]
    AlreadyRunning(String),
    #[error("frpc binary not found at {}, please install frpc first", .0.display())]
    BinaryMissing(PathBuf),
    #[error("server {0} is not running")]
    NotRunning(String),
    #[error("failed to stop frpc for server {server_id}: {source}")]
    Kill {
        server_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Error codes for control API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Malformed request
    BadRequest,
    /// Unknown route
    NotFound,
    /// Uploaded archive exceeds the configured cap
    PayloadTooLarge,
    /// Server id cannot be used as a file name
    InvalidServerId,
    /// Release endpoint or asset download failed
    NetworkError,
    /// Release metadata could not be parsed
    DecodeError,
    /// No release asset for this host
    AssetNotFound,
    /// Archive is neither zip nor tar.gz
    UnsupportedFormat,
    /// Archive holds no frpc binary
    BinaryNotFoundInArchive,
    /// frpc is not installed
    NotInstalled,
    /// Installed frpc could not report its version
    VersionQueryFailed,
    /// Start attempted without a provisioned binary
    BinaryMissing,
    /// Server already has a live process
    AlreadyRunning,
    /// Server has no live process
    NotRunning,
    /// Terminating the process failed
    KillFailed,
    /// Filesystem or spawn failure
    IoError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::InvalidServerId => StatusCode::BAD_REQUEST,
            ApiErrorCode::NetworkError => StatusCode::BAD_GATEWAY,
            ApiErrorCode::DecodeError => StatusCode::BAD_GATEWAY,
            ApiErrorCode::AssetNotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::UnsupportedFormat => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::BinaryNotFoundInArchive => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorCode::NotInstalled => StatusCode::NOT_FOUND,
            ApiErrorCode::VersionQueryFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::BinaryMissing => StatusCode::PRECONDITION_FAILED,
            ApiErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ApiErrorCode::NotRunning => StatusCode::CONFLICT,
            ApiErrorCode::KillFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::IoError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Api-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ApiErrorCode::InvalidServerId => "INVALID_SERVER_ID",
            ApiErrorCode::NetworkError => "NETWORK_ERROR",
            ApiErrorCode::DecodeError => "DECODE_ERROR",
            ApiErrorCode::AssetNotFound => "ASSET_NOT_FOUND",
            ApiErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ApiErrorCode::BinaryNotFoundInArchive => "BINARY_NOT_FOUND_IN_ARCHIVE",
            ApiErrorCode::NotInstalled => "NOT_INSTALLED",
            ApiErrorCode::VersionQueryFailed => "VERSION_QUERY_FAILED",
            ApiErrorCode::BinaryMissing => "BINARY_MISSING",
            ApiErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ApiErrorCode::NotRunning => "NOT_RUNNING",
            ApiErrorCode::KillFailed => "KILL_FAILED",
            ApiErrorCode::IoError => "IO_ERROR",
        }
    }
}

impl From<&ExtractError> for ApiErrorCode {
    fn from(err: &ExtractError) -> Self {
        match err {
            ExtractError::UnsupportedFormat { .. } => ApiErrorCode::UnsupportedFormat,
            ExtractError::BinaryNotFoundInArchive { .. } => ApiErrorCode::BinaryNotFoundInArchive,
            ExtractError::Io(_) => ApiErrorCode::IoError,
        }
    }
}

impl From<&ProvisionError> for ApiErrorCode {
    fn from(err: &ProvisionError) -> Self {
        match err {
            ProvisionError::HttpStatus { .. } | ProvisionError::Transport { .. } => {
                ApiErrorCode::NetworkError
            }
            ProvisionError::Decode(_) => ApiErrorCode::DecodeError,
            ProvisionError::AssetNotFound { .. } => ApiErrorCode::AssetNotFound,
            ProvisionError::Extract(e) => e.into(),
            ProvisionError::NotInstalled => ApiErrorCode::NotInstalled,
            ProvisionError::VersionQuery(_) => ApiErrorCode::VersionQueryFailed,
            ProvisionError::Io(_) => ApiErrorCode::IoError,
        }
    }
}

impl From<&SupervisorError> for ApiErrorCode {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::InvalidServerId(_) => ApiErrorCode::InvalidServerId,
            SupervisorError::AlreadyRunning(_) => ApiErrorCode::AlreadyRunning,
            SupervisorError::BinaryMissing(_) => ApiErrorCode::BinaryMissing,
            SupervisorError::NotRunning(_) => ApiErrorCode::NotRunning,
            SupervisorError::Kill { .. } => ApiErrorCode::KillFailed,
            SupervisorError::Io { .. } => ApiErrorCode::IoError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ApiErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Api-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Api-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Render a typed error as its JSON response
pub fn error_response<E>(err: &E) -> Response<Full<Bytes>>
where
    E: std::error::Error,
    for<'a> &'a E: Into<ApiErrorCode>,
{
    json_error_response(err.into(), err.to_string())
}
