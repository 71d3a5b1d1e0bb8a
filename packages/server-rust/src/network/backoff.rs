//! Accept-loop backoff for transient listener errors.

use std::io;
use std::time::Duration;

/// First delay after a transient accept failure.
pub const INITIAL_DELAY: Duration = Duration::from_millis(5);

/// Ceiling for the doubling delay.
pub const MAX_DELAY: Duration = Duration::from_secs(1);

/// Doubling delay, reset after every successful accept.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the backoff and returns how long to sleep:
    /// 5 ms, 10 ms, 20 ms, ... capped at 1 s.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => INITIAL_DELAY,
            Some(d) => (d * 2).min(MAX_DELAY),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Whether an accept error is worth retrying rather than surfacing.
///
/// Covers aborted handshakes and descriptor or buffer exhaustion
/// (`EMFILE`, `ENFILE`, `ENOBUFS`, `ENOMEM` on Linux).
#[must_use]
pub fn is_temporary(err: &io::Error) -> bool {
    const ENOMEM: i32 = 12;
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    const ENOBUFS: i32 = 105;

    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(ENOMEM | ENFILE | EMFILE | ENOBUFS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_cap() {
        let mut backoff = AcceptBackoff::new();
        let delays: Vec<_> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut backoff = AcceptBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL_DELAY);
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_temporary(&io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
}
