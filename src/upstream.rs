//! Relay interface towards the upstream pool.
//!
//! Forwarding shares over the network is not implemented; the proxy hands
//! every accepted share to an [`Upstream`] and the default implementation
//! only records it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::share::HASH_LEN;
use tracing::debug;

/// A share that met its session target.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedShare {
    pub worker: String,
    pub job_id: String,
    pub extranonce1: [u8; 4],
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub difficulty: f64,
    pub hash: [u8; HASH_LEN],
}

/// Receives accepted shares for forwarding to the pool.
pub trait Upstream: Send + Sync + 'static {
    fn relay_share(&self, share: &AcceptedShare);
}

/// Upstream that logs what it would forward and counts it.
#[derive(Debug)]
pub struct LoggingUpstream {
    addr: String,
    relayed: AtomicU64,
}

impl LoggingUpstream {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            relayed: AtomicU64::new(0),
        }
    }

    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

impl Upstream for LoggingUpstream {
    fn relay_share(&self, share: &AcceptedShare) {
        let total = self.relayed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            upstream = %self.addr,
            worker = %share.worker,
            job_id = %share.job_id,
            nonce = %share.nonce,
            difficulty = share.difficulty,
            total,
            "Share queued for upstream"
        );
    }
}
