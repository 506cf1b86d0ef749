//! Round-robin selection over the search credential pool.

use std::sync::atomic::{AtomicUsize, Ordering};

use harvester_shared::{Credential, HarvestError, Result};

/// Cycles through credential pairs to spread provider quota across queries.
///
/// Shared by reference across concurrent entity units; the cursor is the only
/// mutable state and is advanced atomically.
#[derive(Debug)]
pub struct KeyRotator {
    credentials: Vec<Credential>,
    cursor: AtomicUsize,
}

impl KeyRotator {
    pub fn new(credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(HarvestError::config("key rotator needs at least one credential pair"));
        }
        Ok(Self {
            credentials,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The credential pair the next query would use, without claiming it.
    pub fn current(&self) -> &Credential {
        &self.credentials[self.position()]
    }

    /// Take the pair at the cursor and move the cursor to `(i + 1) mod N` in
    /// one atomic step. Returns the claimed slot with its pair.
    ///
    /// Concurrent callers always receive distinct consecutive slots.
    pub fn claim(&self) -> (usize, &Credential) {
        let len = self.credentials.len();
        let slot = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
        {
            Ok(previous) | Err(previous) => previous % len,
        };
        (slot, &self.credentials[slot])
    }

    /// Skip the pair at the cursor.
    pub fn advance(&self) {
        self.claim();
    }

    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire) % self.credentials.len()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}
