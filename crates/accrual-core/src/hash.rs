//! Canonical state fingerprints.

use crate::math::U256;
use sha2::{Digest, Sha256};

/// Domain separation tag for single-stream tracker state.
pub const TRACKER_STATE_DOMAIN_V1: &[u8] = b"ACCRUAL_TRACKER_STATE_V1";

/// Domain separation tag for multi-pool engine state.
pub const ENGINE_STATE_DOMAIN_V1: &[u8] = b"ACCRUAL_ENGINE_STATE_V1";

/// Incremental, fixed-width preimage writer. Callers feed fields in a fixed order and feed
/// map entries in key order.
pub struct StateHasher {
    inner: Sha256,
}

impl StateHasher {
    pub fn new(domain: &[u8]) -> Self {
        let mut inner = Sha256::new();
        inner.update(domain);
        Self { inner }
    }

    pub fn id(&mut self, id: &[u8; 32]) -> &mut Self {
        self.inner.update(id);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    pub fn u128(&mut self, v: u128) -> &mut Self {
        self.inner.update(v.to_le_bytes());
        self
    }

    pub fn u256(&mut self, v: U256) -> &mut Self {
        self.inner.update(v.to_le_bytes::<32>());
        self
    }

    pub fn flag(&mut self, v: bool) -> &mut Self {
        self.inner.update([v as u8]);
        self
    }

    /// Length prefix for a following sequence of entries.
    pub fn count(&mut self, n: usize) -> &mut Self {
        self.u64(n as u64)
    }

    pub fn finish(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_and_order_matter() {
        let mut a = StateHasher::new(TRACKER_STATE_DOMAIN_V1);
        a.u128(1).u128(2);
        let mut b = StateHasher::new(TRACKER_STATE_DOMAIN_V1);
        b.u128(2).u128(1);
        let mut c = StateHasher::new(ENGINE_STATE_DOMAIN_V1);
        c.u128(1).u128(2);
        let (a, b, c) = (a.finish(), b.finish(), c.finish());
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
