use std::fmt;
use std::io;

use super::ConnectionState;

/// Transport failures collapsed into the handful of cases callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketErrorKind {
    Refused,
    Closed,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    Timeout,
    ProtocolOrSecurityFailure,
    Unsupported,
    InProgress,
    Unknown,
}

impl SocketErrorKind {
    pub fn classify(err: &io::Error) -> Self {
        if let Some(kind) = err.raw_os_error().and_then(classify_errno) {
            return kind;
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SocketErrorKind::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => SocketErrorKind::Closed,
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => SocketErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SocketErrorKind::PermissionDenied,
            io::ErrorKind::OutOfMemory | io::ErrorKind::AddrInUse => {
                SocketErrorKind::ResourceExhausted
            }
            io::ErrorKind::TimedOut => SocketErrorKind::Timeout,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                SocketErrorKind::ProtocolOrSecurityFailure
            }
            io::ErrorKind::Unsupported => SocketErrorKind::Unsupported,
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => SocketErrorKind::InProgress,
            _ => SocketErrorKind::Unknown,
        }
    }

    /// Human readable diagnostic for logs and terminal output.
    pub fn describe(self) -> &'static str {
        match self {
            SocketErrorKind::Refused => "The connection was refused by the peer (or timed out).",
            SocketErrorKind::Closed => "The remote host closed the connection.",
            SocketErrorKind::NotFound => "The host address was not found.",
            SocketErrorKind::PermissionDenied => "You don't have the required privileges.",
            SocketErrorKind::ResourceExhausted => {
                "The local system ran out of resources (e.g., too many sockets)."
            }
            SocketErrorKind::Timeout => "The socket operation timed out.",
            SocketErrorKind::ProtocolOrSecurityFailure => {
                "The peer sent data that could not be understood or failed a security check."
            }
            SocketErrorKind::Unsupported => "Unsupported socket operation.",
            SocketErrorKind::InProgress => {
                "The last operation attempted has not finished yet (still in progress in the background)."
            }
            SocketErrorKind::Unknown => "Unknown error.",
        }
    }

    /// Whether the error leaves the connection itself unusable, as opposed to
    /// failing only the command that was being written.
    ///
    /// `state` is the connection state when the error was observed. `Closed`
    /// always ends the connection, `Refused` ends one that was up, and any
    /// error ends a connection that is not up.
    pub fn is_connection_fatal(self, state: &ConnectionState) -> bool {
        match self {
            SocketErrorKind::Closed | SocketErrorKind::Refused => true,
            _ => !matches!(state, ConnectionState::Connected),
        }
    }
}

impl fmt::Display for SocketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(unix)]
fn classify_errno(code: i32) -> Option<SocketErrorKind> {
    match code {
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
            Some(SocketErrorKind::ResourceExhausted)
        }
        libc::EINPROGRESS | libc::EALREADY => Some(SocketErrorKind::InProgress),
        libc::EHOSTUNREACH | libc::ENETUNREACH => Some(SocketErrorKind::NotFound),
        libc::EPROTO | libc::EPROTONOSUPPORT => Some(SocketErrorKind::ProtocolOrSecurityFailure),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_errno(_code: i32) -> Option<SocketErrorKind> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [SocketErrorKind; 10] = [
        SocketErrorKind::Refused,
        SocketErrorKind::Closed,
        SocketErrorKind::NotFound,
        SocketErrorKind::PermissionDenied,
        SocketErrorKind::ResourceExhausted,
        SocketErrorKind::Timeout,
        SocketErrorKind::ProtocolOrSecurityFailure,
        SocketErrorKind::Unsupported,
        SocketErrorKind::InProgress,
        SocketErrorKind::Unknown,
    ];

    #[test]
    fn classifies_common_io_kinds() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, SocketErrorKind::Refused),
            (io::ErrorKind::ConnectionReset, SocketErrorKind::Closed),
            (io::ErrorKind::BrokenPipe, SocketErrorKind::Closed),
            (io::ErrorKind::UnexpectedEof, SocketErrorKind::Closed),
            (io::ErrorKind::NotFound, SocketErrorKind::NotFound),
            (io::ErrorKind::PermissionDenied, SocketErrorKind::PermissionDenied),
            (io::ErrorKind::AddrInUse, SocketErrorKind::ResourceExhausted),
            (io::ErrorKind::TimedOut, SocketErrorKind::Timeout),
            (io::ErrorKind::InvalidData, SocketErrorKind::ProtocolOrSecurityFailure),
            (io::ErrorKind::Unsupported, SocketErrorKind::Unsupported),
            (io::ErrorKind::WouldBlock, SocketErrorKind::InProgress),
            (io::ErrorKind::Other, SocketErrorKind::Unknown),
        ];
        for (kind, expected) in cases {
            let err = io::Error::new(kind, "synthetic");
            assert_eq!(SocketErrorKind::classify(&err), expected, "{kind:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn classifies_raw_errno_values() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(SocketErrorKind::classify(&err), SocketErrorKind::ResourceExhausted);
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(SocketErrorKind::classify(&err), SocketErrorKind::Refused);
        let err = io::Error::from_raw_os_error(libc::EINPROGRESS);
        assert_eq!(SocketErrorKind::classify(&err), SocketErrorKind::InProgress);
    }

    #[test]
    fn every_kind_has_a_distinct_description() {
        let descriptions: HashSet<_> = ALL.iter().map(|kind| kind.describe()).collect();
        assert_eq!(descriptions.len(), ALL.len());
        assert_eq!(
            SocketErrorKind::Closed.to_string(),
            "The remote host closed the connection."
        );
    }

    #[test]
    fn closed_and_refused_end_a_live_connection() {
        let connected = ConnectionState::Connected;
        assert!(SocketErrorKind::Closed.is_connection_fatal(&connected));
        assert!(SocketErrorKind::Refused.is_connection_fatal(&connected));
        assert!(!SocketErrorKind::Timeout.is_connection_fatal(&connected));
        assert!(!SocketErrorKind::PermissionDenied.is_connection_fatal(&connected));

        let failed = ConnectionState::Failed(SocketErrorKind::Refused);
        assert!(SocketErrorKind::Refused.is_connection_fatal(&failed));
        assert!(SocketErrorKind::Timeout.is_connection_fatal(&ConnectionState::Idle));
    }
}
