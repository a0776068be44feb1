//! Network error classification shared by executors, the connection
//! manager and the polling engine.

use repeater_proto::ErrorCode;
use std::error::Error as StdError;
use std::io;

/// Errors that can name the network condition behind them.
pub trait WithErrorCode {
    fn error_code(&self) -> Option<ErrorCode>;
}

/// Plain-English cause for a known code. `None` for pass-through codes.
pub fn describe(code: &ErrorCode) -> Option<&'static str> {
    let text = match code {
        ErrorCode::DnsNotFound => {
            "Unable to resolve the host name. Check the address and this machine's DNS settings."
        }
        ErrorCode::DnsTryAgain => "DNS lookup timed out. The name server did not answer in time.",
        ErrorCode::ConnectionRefused => {
            "Connection refused. Nothing is listening on the target address and port."
        }
        ErrorCode::ConnectionReset => "Connection reset by the remote host.",
        ErrorCode::ConnectionAborted => "Connection aborted before it could complete.",
        ErrorCode::TimedOut => "Connection timed out. The target did not respond in time.",
        ErrorCode::HostUnreachable => "Host unreachable. No route to the target host.",
        ErrorCode::NetworkUnreachable => "Network unreachable. Check this machine's network access.",
        ErrorCode::BrokenPipe => "Connection closed by the remote host while sending data.",
        ErrorCode::UnsupportedProtocol => "The requested protocol is not supported by this repeater.",
        ErrorCode::InvalidUrl => "The target URL is malformed.",
        ErrorCode::Other(_) => return None,
    };
    Some(text)
}

/// One-line message for a failure: the mapped sentence for known codes,
/// the raw error text otherwise.
pub fn human_message<E>(err: &E) -> String
where
    E: StdError + WithErrorCode + ?Sized,
{
    err.error_code()
        .as_ref()
        .and_then(describe)
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string())
}

pub fn code_from_io(err: &io::Error) -> Option<ErrorCode> {
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
        io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
        io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
        io::ErrorKind::TimedOut => ErrorCode::TimedOut,
        io::ErrorKind::BrokenPipe => ErrorCode::BrokenPipe,
        io::ErrorKind::HostUnreachable => ErrorCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ErrorCode::NetworkUnreachable,
        _ => return code_from_message(&err.to_string()),
    };
    Some(code)
}

/// Resolver failures surface as opaque io errors; the message is all we get.
fn code_from_message(message: &str) -> Option<ErrorCode> {
    let message = message.to_ascii_lowercase();
    if message.contains("temporary failure in name resolution") {
        Some(ErrorCode::DnsTryAgain)
    } else if message.contains("failed to lookup address")
        || message.contains("name or service not known")
        || message.contains("nodename nor servname")
        || message.contains("no such host")
        || message.contains("dns error")
    {
        Some(ErrorCode::DnsNotFound)
    } else {
        None
    }
}

/// Walks an error's source chain looking for something classifiable.
pub fn code_from_chain(err: &(dyn StdError + 'static)) -> Option<ErrorCode> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if let Some(code) = code_from_io(io_err) {
                return Some(code);
            }
        }
        if let Some(code) = code_from_message(&err.to_string()) {
            return Some(code);
        }
        current = err.source();
    }
    None
}

pub fn code_from_reqwest(err: &reqwest::Error) -> Option<ErrorCode> {
    if err.is_timeout() {
        return Some(ErrorCode::TimedOut);
    }
    code_from_chain(err)
}
