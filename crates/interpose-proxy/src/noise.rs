//! Expected transport noise.
//!
//! Clients routinely tear connections down mid-exchange, most visibly during
//! TLS shutdown after a CONNECT. Those resets are not failures of the proxy and
//! are kept out of the log and the event stream. Everything else is a real
//! error.

use std::error::Error;
use std::io;

/// Returns true if `err`, or anything in its `source()` chain, is a peer
/// reset or abrupt disconnect.
pub fn is_expected_noise(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(link) = current {
        if link_is_noise(link) {
            return true;
        }
        current = link.source();
    }
    false
}

fn link_is_noise(err: &(dyn Error + 'static)) -> bool {
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        ) {
            return true;
        }
    }

    if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
        if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
            return true;
        }
    }

    message_is_reset(&err.to_string())
}

fn message_is_reset(message: &str) -> bool {
    message.contains("ECONNRESET") || message.to_ascii_lowercase().contains("connection reset")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped {
        context: &'static str,
        source: Box<dyn Error + Send + Sync>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.context)
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(self.source.as_ref())
        }
    }

    fn io(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "boom")
    }

    #[test]
    fn reset_kinds_are_noise() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert!(is_expected_noise(&io(kind)), "{:?}", kind);
        }
    }

    #[test]
    fn other_io_errors_are_real() {
        assert!(!is_expected_noise(&io(io::ErrorKind::ConnectionRefused)));
        assert!(!is_expected_noise(&io(io::ErrorKind::TimedOut)));
        assert!(!is_expected_noise(&io(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn reset_deep_in_the_chain() {
        let err = Wrapped {
            context: "client error (SendRequest)",
            source: Box::new(Wrapped {
                context: "connection error",
                source: Box::new(io(io::ErrorKind::ConnectionReset)),
            }),
        };
        assert!(is_expected_noise(&err));
    }

    #[test]
    fn real_error_chain() {
        let err = Wrapped {
            context: "client error (Connect)",
            source: Box::new(io(io::ErrorKind::ConnectionRefused)),
        };
        assert!(!is_expected_noise(&err));
    }

    #[test]
    fn reset_messages() {
        let err = io::Error::other("read ECONNRESET");
        assert!(is_expected_noise(&err));

        let err = io::Error::other("Connection reset by peer (os error 104)");
        assert!(is_expected_noise(&err));

        let err = io::Error::other("certificate unknown");
        assert!(!is_expected_noise(&err));
    }
}
