//! Follower sync state machine and reconnect backoff.

use std::time::Duration;

/// Follower connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Connecting,
    /// Catching up on historical entries from `from_seq`.
    Syncing { from_seq: u64 },
    /// Live-tailing the primary.
    Streaming,
    /// Reconnect retries exhausted; operator attention required.
    Error { reason: String },
}

impl SyncState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SyncState::Syncing { .. } | SyncState::Streaming)
    }
}

/// Exponential backoff: base 1 s, doubling, capped at 60 s, at most 10
/// consecutive retries before surfacing a hard error.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries: 10,
            attempt: 0,
        }
    }
}

impl Backoff {
    /// Delay before the next retry, or `None` when retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let exp = self.attempt.min(31);
        self.attempt += 1;
        let delay = self
            .base
            .checked_mul(1u32 << exp.min(6))
            .unwrap_or(self.cap);
        Some(delay.min(self.cap))
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();

        assert_eq!(delays.len(), 10);
        assert_eq!(&delays[..7], &[1, 2, 4, 8, 16, 32, 60]);
        // Capped from then on.
        assert!(delays[7..].iter().all(|&d| d == 60));
        // Exhausted.
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_state_connectivity() {
        assert!(!SyncState::Disconnected.is_connected());
        assert!(!SyncState::Connecting.is_connected());
        assert!(SyncState::Syncing { from_seq: 1 }.is_connected());
        assert!(SyncState::Streaming.is_connected());
        assert!(!SyncState::Error {
            reason: "x".into()
        }
        .is_connected());
    }
}
