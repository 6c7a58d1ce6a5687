//! The single active-session record.
//!
//! At most one session id holds the terminal slot at a time. Expiry is
//! evaluated lazily on every access; a stale record is only ever overwritten
//! by the next successful claim, never swept.

use crate::access::may_claim;
use cyberdeck_core::{DeckError, DeckResult};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// The stored claim on the terminal slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub ip: IpAddr,
    /// Unix seconds; the claim is active while `now < expires_at`.
    pub expires_at: u64,
}

impl SessionRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Returned by a successful [`SessionRegistry::claim_or_renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub ip: IpAddr,
    pub expires_at: u64,
    /// The same id already held the slot; only the expiry moved.
    pub renewed: bool,
}

/// Owner of the process-wide session record.
#[derive(Debug)]
pub struct SessionRegistry {
    active: Mutex<Option<SessionRecord>>,
    ttl: u64,
}

impl SessionRegistry {
    pub fn new(ttl: u64) -> Self {
        Self {
            active: Mutex::new(None),
            ttl,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<SessionRecord>> {
        // The record is a plain value; a panic elsewhere cannot leave it torn.
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for `client_id`, or extend its existing claim.
    ///
    /// Fails with [`DeckError::SessionConflict`] when a different id holds an
    /// unexpired claim; the stored record is left untouched in that case.
    pub fn claim_or_renew(
        &self,
        client_id: &str,
        client_ip: IpAddr,
        now: u64,
    ) -> DeckResult<SessionHandle> {
        let mut slot = self.slot();
        if !may_claim(client_id, slot.as_ref(), now) {
            debug!(session_id = %client_id, "claim rejected, slot held by another session");
            return Err(DeckError::SessionConflict);
        }

        let renewed = slot
            .as_ref()
            .is_some_and(|r| r.id == client_id && !r.is_expired(now));
        let record = SessionRecord {
            id: client_id.to_string(),
            ip: client_ip,
            expires_at: now.saturating_add(self.ttl),
        };

        if renewed {
            debug!(session_id = %client_id, expires_at = record.expires_at, "session renewed");
        } else {
            match slot.as_ref() {
                Some(stale) if stale.id != client_id => {
                    info!(session_id = %client_id, ip = %client_ip, superseded = %stale.id, "session claimed")
                }
                _ => info!(session_id = %client_id, ip = %client_ip, "session claimed"),
            }
        }

        let handle = SessionHandle {
            id: record.id.clone(),
            ip: record.ip,
            expires_at: record.expires_at,
            renewed,
        };
        *slot = Some(record);
        Ok(handle)
    }

    /// Whether `id` holds an unexpired claim right now.
    pub fn is_current(&self, id: &str, now: u64) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|r| r.id == id && !r.is_expired(now))
    }

    /// Clear the record, but only if it still belongs to `id`.
    ///
    /// Returns whether anything was cleared. A session that was already
    /// superseded cannot clobber its successor.
    pub fn release(&self, id: &str) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(r) if r.id == id => {
                *slot = None;
                info!(session_id = %id, "session released");
                true
            }
            _ => false,
        }
    }

    /// Copy of the current record, expired or not.
    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.slot().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    const TTL: u64 = 3600;

    fn ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    #[test]
    fn first_claim_installs_record() {
        let reg = SessionRegistry::new(TTL);
        let h = reg.claim_or_renew("a", ip(), 100).unwrap();
        assert!(!h.renewed);
        assert_eq!(h.expires_at, 100 + TTL);
        assert_eq!(
            reg.snapshot(),
            Some(SessionRecord {
                id: "a".into(),
                ip: ip(),
                expires_at: 100 + TTL
            })
        );
    }

    #[test]
    fn renewal_extends_expiry_keeps_identity() {
        let reg = SessionRegistry::new(TTL);
        reg.claim_or_renew("a", ip(), 0).unwrap();
        let h = reg.claim_or_renew("a", ip(), TTL - 1).unwrap();
        assert!(h.renewed);
        assert_eq!(h.id, "a");
        assert_eq!(h.expires_at, 2 * TTL - 1);
    }

    #[test]
    fn conflict_leaves_record_untouched() {
        let reg = SessionRegistry::new(TTL);
        reg.claim_or_renew("a", ip(), 0).unwrap();
        let before = reg.snapshot();
        let err = reg
            .claim_or_renew("b", "10.0.0.2".parse().unwrap(), 10)
            .unwrap_err();
        assert!(matches!(err, DeckError::SessionConflict));
        assert_eq!(reg.snapshot(), before);
    }

    #[test]
    fn ttl_boundaries() {
        let t0 = 5_000;
        let reg = SessionRegistry::new(TTL);
        reg.claim_or_renew("a", ip(), t0).unwrap();

        assert!(reg.is_current("a", t0 + TTL - 1));
        assert!(reg.claim_or_renew("b", ip(), t0 + TTL - 1).is_err());
        assert!(reg.claim_or_renew("a", ip(), t0 + TTL - 1).is_ok());

        let reg = SessionRegistry::new(TTL);
        reg.claim_or_renew("a", ip(), t0).unwrap();
        assert!(!reg.is_current("a", t0 + TTL + 1));
        let h = reg.claim_or_renew("b", ip(), t0 + TTL + 1).unwrap();
        assert!(!h.renewed);
        assert!(reg.is_current("b", t0 + TTL + 1));
        assert!(!reg.is_current("a", t0 + TTL + 1));
    }

    #[test]
    fn expired_same_id_reclaim_is_not_a_renewal() {
        let reg = SessionRegistry::new(10);
        reg.claim_or_renew("a", ip(), 0).unwrap();
        let h = reg.claim_or_renew("a", ip(), 50).unwrap();
        assert!(!h.renewed);
    }

    #[test]
    fn release_is_compare_and_clear() {
        let reg = SessionRegistry::new(10);
        reg.claim_or_renew("a", ip(), 0).unwrap();
        // "a" expires and "b" takes over; a late release from "a" must not clobber "b".
        reg.claim_or_renew("b", ip(), 20).unwrap();
        assert!(!reg.release("a"));
        assert!(reg.is_current("b", 21));
        assert!(reg.release("b"));
        assert!(reg.snapshot().is_none());
        assert!(!reg.release("b"));
    }

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        let reg = Arc::new(SessionRegistry::new(TTL));
        let barrier = Arc::new(Barrier::new(8));
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    if reg.claim_or_renew(&format!("client-{i}"), ip(), 1).is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(reg.snapshot().is_some());
    }
}
