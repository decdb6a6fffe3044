//! In-flight Generation Locks
//!
//! At most one generation runs per target (a lesson, a visualization) at a
//! time. A second request for the same target is rejected rather than queued,
//! unless the existing claim is older than the staleness threshold, in which
//! case it is treated as abandoned and replaced.
//!
//! Check and claim happen under one mutex, so within a process the claim is
//! atomic. Claims are not shared between processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("a generation for '{target}' is already in progress (started {age_secs}s ago)")]
pub struct AlreadyGenerating {
    pub target: String,
    pub age_secs: u64,
}

#[derive(Debug, Default)]
struct ClaimTable {
    next_id: u64,
    /// Target -> (claim id, claimed at).
    entries: HashMap<String, (u64, Instant)>,
}

type Claims = Arc<Mutex<ClaimTable>>;

#[derive(Clone)]
pub struct GenerationLocks {
    stale_after: Duration,
    claims: Claims,
}

impl GenerationLocks {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            claims: Arc::new(Mutex::new(ClaimTable::default())),
        }
    }

    /// Claims `target` for the lifetime of the returned guard.
    pub fn try_claim(&self, target: &str) -> Result<GenerationClaim, AlreadyGenerating> {
        let mut claims = lock(&self.claims);
        let now = Instant::now();

        if let Some((_, started)) = claims.entries.get(target) {
            let age = now.duration_since(*started);
            if age < self.stale_after {
                return Err(AlreadyGenerating {
                    target: target.to_string(),
                    age_secs: age.as_secs(),
                });
            }
            warn!(claim_target = target, age_secs = age.as_secs(), "Replacing abandoned generation claim");
        }

        claims.next_id += 1;
        let id = claims.next_id;
        claims.entries.insert(target.to_string(), (id, now));
        info!(claim_target = target, "Generation claim acquired");
        Ok(GenerationClaim {
            target: target.to_string(),
            id,
            claims: Arc::clone(&self.claims),
        })
    }

    pub fn is_claimed(&self, target: &str) -> bool {
        lock(&self.claims).entries.contains_key(target)
    }
}

fn lock(claims: &Claims) -> MutexGuard<'_, ClaimTable> {
    claims.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the claim on drop. A claim that was already replaced as
/// abandoned leaves its successor in place.
#[derive(Debug)]
pub struct GenerationClaim {
    target: String,
    id: u64,
    claims: Claims,
}

impl GenerationClaim {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for GenerationClaim {
    fn drop(&mut self) {
        let mut claims = lock(&self.claims);
        if claims.entries.get(&self.target).map(|(id, _)| *id) == Some(self.id) {
            claims.entries.remove(&self.target);
        }
    }
}
