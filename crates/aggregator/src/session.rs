use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// The subject of a load: one account address plus an optional chain filter.
/// Addresses compare case-insensitively, so the stored form is lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub address: String,
    pub chain: Option<String>,
}

impl Subject {
    pub fn new(address: &str, chain: Option<&str>) -> Self {
        Self {
            address: address.to_ascii_lowercase(),
            chain: chain.map(str::to_string),
        }
    }
}

/// One cancellable unit of work: the in-flight load for a single subject.
///
/// A session is created when a load starts and cancelled when a different
/// subject takes over or the consuming view tears down. It is never reused;
/// in-flight work belonging to a cancelled session must not write to shared
/// state.
#[derive(Debug)]
pub struct LoadSession {
    cancel: CancellationToken,
    history_started: AtomicBool,
}

impl LoadSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            history_started: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim this session's single history backfill. Returns `false` when a
    /// backfill already ran (or started) for this session.
    pub fn try_start_history(&self) -> bool {
        self.history_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_address_compare_ignores_case() {
        let a = Subject::new("0xABC", Some("eth"));
        let b = Subject::new("0xabc", Some("eth"));
        assert_eq!(a, b);

        let other_chain = Subject::new("0xabc", None);
        assert_ne!(a, other_chain);
    }

    #[test]
    fn test_session_starts_uncancelled() {
        let session = LoadSession::new();
        assert!(!session.is_cancelled());
        session.cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn test_history_claim_is_single_use() {
        let session = LoadSession::new();
        assert!(session.try_start_history());
        assert!(!session.try_start_history());
    }
}
