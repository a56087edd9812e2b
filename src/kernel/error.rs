//! Kernel error taxonomy
//!
//! Every failure that can cross a context boundary is an `ApiError`: a
//! stable kind plus a message. Kinds map to POSIX-style codes so errors
//! survive serialization over the sync bridge, where a thrown value would
//! not. The wire shape is `{$err_class_name, code, message, stack}`.

use serde::{Deserialize, Serialize};
use std::io;

/// Stable error kinds understood on both sides of a context boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidInput,
    IsADirectory,
    NotADirectory,
    NotEmpty,
    BrokenPipe,
    TimedOut,
    Interrupted,
    Unsupported,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    AddrInUse,
    AddrNotAvailable,
    Other,
}

impl ErrorKind {
    /// Class name used as `$err_class_name` on the wire.
    /// Unrecognized errors travel as plain "Error".
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::IsADirectory => "IsADirectory",
            ErrorKind::NotADirectory => "NotADirectory",
            ErrorKind::NotEmpty => "NotEmpty",
            ErrorKind::BrokenPipe => "BrokenPipe",
            ErrorKind::TimedOut => "TimedOut",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ConnectionRefused => "ConnectionRefused",
            ErrorKind::ConnectionReset => "ConnectionReset",
            ErrorKind::ConnectionAborted => "ConnectionAborted",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::AddrInUse => "AddrInUse",
            ErrorKind::AddrNotAvailable => "AddrNotAvailable",
            ErrorKind::Other => "Error",
        }
    }

    /// POSIX-style code for wire transport
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::PermissionDenied => "EACCES",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::InvalidInput => "EINVAL",
            ErrorKind::IsADirectory => "EISDIR",
            ErrorKind::NotADirectory => "ENOTDIR",
            ErrorKind::NotEmpty => "ENOTEMPTY",
            ErrorKind::BrokenPipe => "EPIPE",
            ErrorKind::TimedOut => "ETIMEDOUT",
            ErrorKind::Interrupted => "EINTR",
            ErrorKind::Unsupported => "ENOTSUP",
            ErrorKind::ConnectionRefused => "ECONNREFUSED",
            ErrorKind::ConnectionReset => "ECONNRESET",
            ErrorKind::ConnectionAborted => "ECONNABORTED",
            ErrorKind::NotConnected => "ENOTCONN",
            ErrorKind::AddrInUse => "EADDRINUSE",
            ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
            ErrorKind::Other => "EIO",
        }
    }

    /// Recover a kind from a wire code. Unknown codes become `Other`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "ENOENT" => ErrorKind::NotFound,
            "EACCES" => ErrorKind::PermissionDenied,
            "EEXIST" => ErrorKind::AlreadyExists,
            "EINVAL" => ErrorKind::InvalidInput,
            "EISDIR" => ErrorKind::IsADirectory,
            "ENOTDIR" => ErrorKind::NotADirectory,
            "ENOTEMPTY" => ErrorKind::NotEmpty,
            "EPIPE" => ErrorKind::BrokenPipe,
            "ETIMEDOUT" => ErrorKind::TimedOut,
            "EINTR" => ErrorKind::Interrupted,
            "ENOTSUP" => ErrorKind::Unsupported,
            "ECONNREFUSED" => ErrorKind::ConnectionRefused,
            "ECONNRESET" => ErrorKind::ConnectionReset,
            "ECONNABORTED" => ErrorKind::ConnectionAborted,
            "ENOTCONN" => ErrorKind::NotConnected,
            "EADDRINUSE" => ErrorKind::AddrInUse,
            "EADDRNOTAVAIL" => ErrorKind::AddrNotAvailable,
            _ => ErrorKind::Other,
        }
    }
}

/// Domain error raised by ops, the filesystem, and resources
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// Dispatch failure: the numeric code resolves to no registered op
    pub fn op_not_found(code: u32) -> Self {
        Self::new(ErrorKind::NotFound, format!("no op registered at index {code}"))
    }

    /// Dispatch failure: the op exists but has no implementation for the
    /// requested mode
    pub fn op_mode_unsupported(name: &str, mode: &str) -> Self {
        Self::new(
            ErrorKind::Unsupported,
            format!("op {name} has no {mode} implementation"),
        )
    }

    /// Only `*Sync`-suffixed operations may cross the blocking bridge
    pub fn unsupported_over_sync_bridge(name: &str) -> Self {
        Self::new(
            ErrorKind::Unsupported,
            format!("{name} is not supported over the sync bridge"),
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<io::Error> for ApiError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
            io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            io::ErrorKind::AddrInUse => ErrorKind::AddrInUse,
            io::ErrorKind::AddrNotAvailable => ErrorKind::AddrNotAvailable,
            _ => ErrorKind::Other,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidInput, e.to_string())
    }
}

/// Structured error as it travels on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "$err_class_name")]
    pub class_name: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&ApiError> for WireError {
    fn from(e: &ApiError) -> Self {
        Self {
            class_name: e.kind.class_name().to_string(),
            code: e.kind.code().to_string(),
            message: e.message.clone(),
            stack: None,
        }
    }
}

impl From<WireError> for ApiError {
    fn from(w: WireError) -> Self {
        Self::new(ErrorKind::from_code(&w.code), w.message)
    }
}
