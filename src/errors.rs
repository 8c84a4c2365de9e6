//! Error categorization for probe failures.
//!
//! The request timer never fails its caller; instead every transport-level
//! failure is folded into the response record as a message plus one of these
//! categories, so result consumers can group failures without parsing text.

use std::fmt;
use std::io;

/// Categories of failures that can occur while executing a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The request config could not be turned into a request (bad URL, method, header)
    InvalidRequest,

    /// Hostname resolution failed or returned no addresses
    DnsError,

    /// TCP connection could not be established (refused, unreachable, reset)
    ConnectError,

    /// TLS handshake failed or the server name was not valid for TLS
    TlsError,

    /// The caller-supplied timeout elapsed
    TimeoutError,

    /// HTTP framing or protocol failure before the response head arrived
    ProtocolError,

    /// The connection failed while the response body was being read
    BodyError,
}

impl ErrorCategory {
    /// Categorize an I/O error raised while connecting.
    pub fn from_connect_error(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut => ErrorCategory::TimeoutError,
            _ => ErrorCategory::ConnectError,
        }
    }

    /// Categorize a hyper error raised while exchanging the request.
    pub fn from_hyper_error(error: &hyper::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() {
            ErrorCategory::ConnectError
        } else if error.is_body_write_aborted() || error.is_incomplete_message() {
            ErrorCategory::BodyError
        } else {
            ErrorCategory::ProtocolError
        }
    }

    /// Get the label used in result records and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::DnsError => "dns_error",
            ErrorCategory::ConnectError => "connect_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::ProtocolError => "protocol_error",
            ErrorCategory::BodyError => "body_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidRequest => "Invalid Request Configuration",
            ErrorCategory::DnsError => "DNS Resolution Errors",
            ErrorCategory::ConnectError => "TCP Connection Errors",
            ErrorCategory::TlsError => "TLS Handshake Errors",
            ErrorCategory::TimeoutError => "Probe Timeout Errors",
            ErrorCategory::ProtocolError => "HTTP Protocol Errors",
            ErrorCategory::BodyError => "Response Body Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A probe failure with its category, as carried into a response record.
#[derive(Debug, Clone)]
pub struct ProbeError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ProbeError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category.label(), self.message)
    }
}
