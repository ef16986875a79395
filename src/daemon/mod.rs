//! Long-running daemons
//!
//! The reconciliation loop, the mesh underlay sync, and the iBGP sync.

pub mod ibgp;
pub mod mesh;
pub mod sync;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-peer locks. A peer restart through the operator API and a
/// reconciler pass touching the same peer serialize on these, so a
/// restart can never interleave with an apply and drop a firewall rule.
#[derive(Default)]
pub struct PeerLocks {
    locks: DashMap<u32, Arc<Mutex<()>>>,
}

impl PeerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, asn: u32) -> Arc<Mutex<()>> {
        self.locks
            .entry(asn)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn forget(&self, asn: u32) {
        self.locks.remove(&asn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_asn_shares_a_lock() {
        let locks = PeerLocks::new();
        let a = locks.lock_for(4242420337);
        let b = locks.lock_for(4242420337);
        assert!(Arc::ptr_eq(&a, &b));

        let guard = a.lock().await;
        assert!(b.try_lock().is_err());
        drop(guard);
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_different_asns_do_not_contend() {
        let locks = PeerLocks::new();
        let a = locks.lock_for(1);
        let b = locks.lock_for(2);
        let _ga = a.lock().await;
        assert!(b.try_lock().is_ok());
    }
}
