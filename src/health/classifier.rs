// Error classification
//
// Maps transport failures into the closed ErrorCategory set. The cause chain is
// walked outermost-first and the first recognizable condition wins.

use std::error::Error as StdError;
use std::io;

use crate::ErrorCategory;

/// Message fragments that indicate an abrupt close or protocol incompatibility.
const VERSION_ISSUE_PATTERNS: &[&str] = &[
    "eof",
    "end of file",
    "protocol version",
    "version mismatch",
    "unsupported version",
    "unsupported protocol",
    "wrong version number",
];

/// Classify an error into an [`ErrorCategory`].
pub fn categorize(err: &(dyn StdError + 'static)) -> ErrorCategory {
    let mut current = Some(err);
    while let Some(error) = current {
        let category = categorize_single(error);
        if category != ErrorCategory::Unknown {
            return category;
        }
        current = error.source();
    }
    ErrorCategory::Unknown
}

/// Whether the error looks like a version-compatibility problem.
///
/// End-of-stream during a handshake counts: peers running an incompatible
/// protocol tend to hang up instead of answering.
pub fn is_version_issue(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(error) = current {
        if let Some(io_err) = error.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::UnexpectedEof {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                if is_version_issue(inner) {
                    return true;
                }
            }
        }
        if matches_version_pattern(&error.to_string()) {
            return true;
        }
        current = error.source();
    }
    false
}

fn categorize_single(error: &(dyn StdError + 'static)) -> ErrorCategory {
    if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return ErrorCategory::Timeout;
    }

    if let Some(io_err) = error.downcast_ref::<io::Error>() {
        let category = categorize_io(io_err);
        if category != ErrorCategory::Unknown {
            return category;
        }
        // io::Error::source skips the wrapped payload itself
        if let Some(inner) = io_err.get_ref() {
            return categorize(inner);
        }
        return ErrorCategory::Unknown;
    }

    if matches_version_pattern(&error.to_string()) {
        return ErrorCategory::ConnectionReset;
    }

    ErrorCategory::Unknown
}

fn categorize_io(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ErrorCategory::ConnectionReset,
        io::ErrorKind::TimedOut => ErrorCategory::Timeout,
        io::ErrorKind::ConnectionRefused => ErrorCategory::ConnectionRefused,
        io::ErrorKind::NetworkUnreachable => ErrorCategory::NetworkUnreachable,
        io::ErrorKind::NetworkDown => ErrorCategory::NetworkDown,
        io::ErrorKind::HostUnreachable => ErrorCategory::HostUnreachable,
        _ => err
            .raw_os_error()
            .map(platform::categorize_os_code)
            .unwrap_or(ErrorCategory::Unknown),
    }
}

fn matches_version_pattern(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    VERSION_ISSUE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Platform adapters for raw OS error codes.
pub mod platform {
    use crate::ErrorCategory;

    #[cfg(windows)]
    pub fn categorize_os_code(code: i32) -> ErrorCategory {
        categorize_winsock_code(code)
    }

    #[cfg(not(windows))]
    pub fn categorize_os_code(_code: i32) -> ErrorCategory {
        ErrorCategory::Unknown
    }

    /// Winsock error numbers (WSAE*)
    #[cfg(any(windows, test))]
    pub(crate) fn categorize_winsock_code(code: i32) -> ErrorCategory {
        match code {
            10053 | 10054 => ErrorCategory::ConnectionReset, // WSAECONNABORTED, WSAECONNRESET
            10060 => ErrorCategory::Timeout,                 // WSAETIMEDOUT
            10061 => ErrorCategory::ConnectionRefused,       // WSAECONNREFUSED
            10051 => ErrorCategory::NetworkUnreachable,      // WSAENETUNREACH
            10050 => ErrorCategory::NetworkDown,             // WSAENETDOWN
            10065 => ErrorCategory::HostUnreachable,         // WSAEHOSTUNREACH
            _ => ErrorCategory::Unknown,
        }
    }
}
