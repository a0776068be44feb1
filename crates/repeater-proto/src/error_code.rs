use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes carried in `Response.errorCode`. The controller matches on
/// the POSIX-style strings, so unknown codes round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    DnsNotFound,
    DnsTryAgain,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    TimedOut,
    HostUnreachable,
    NetworkUnreachable,
    BrokenPipe,
    UnsupportedProtocol,
    InvalidUrl,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::DnsNotFound => "ENOTFOUND",
            ErrorCode::DnsTryAgain => "EAI_AGAIN",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::ConnectionAborted => "ECONNABORTED",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::HostUnreachable => "EHOSTUNREACH",
            ErrorCode::NetworkUnreachable => "ENETUNREACH",
            ErrorCode::BrokenPipe => "EPIPE",
            ErrorCode::UnsupportedProtocol => "ERR_UNSUPPORTED_PROTOCOL",
            ErrorCode::InvalidUrl => "ERR_INVALID_URL",
            ErrorCode::Other(code) => code.as_str(),
        }
    }

    /// Codes that describe a condition likely to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::DnsTryAgain
                | ErrorCode::ConnectionRefused
                | ErrorCode::ConnectionReset
                | ErrorCode::ConnectionAborted
                | ErrorCode::TimedOut
                | ErrorCode::HostUnreachable
                | ErrorCode::NetworkUnreachable
                | ErrorCode::BrokenPipe
        )
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ENOTFOUND" => ErrorCode::DnsNotFound,
            "EAI_AGAIN" => ErrorCode::DnsTryAgain,
            "ECONNREFUSED" => ErrorCode::ConnectionRefused,
            "ECONNRESET" => ErrorCode::ConnectionReset,
            "ECONNABORTED" => ErrorCode::ConnectionAborted,
            "ETIMEDOUT" => ErrorCode::TimedOut,
            "EHOSTUNREACH" => ErrorCode::HostUnreachable,
            "ENETUNREACH" => ErrorCode::NetworkUnreachable,
            "EPIPE" => ErrorCode::BrokenPipe,
            "ERR_UNSUPPORTED_PROTOCOL" => ErrorCode::UnsupportedProtocol,
            "ERR_INVALID_URL" => ErrorCode::InvalidUrl,
            _ => ErrorCode::Other(value),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Other(code) => code,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
