//! # Bootstrap Resolution
//!
//! Peers that have no skip-graph node of their own find the overlay without a
//! directory service. The overlay registers an entry point in the DHT under
//! each of `population` deterministic keys; a joining or querying peer picks
//! one of those keys at random and looks it up.
//!
//! The pool is a pure function of the current population, which changes over
//! simulated time, so it is recomputed on every call and never cached. Each
//! operation keeps its own blacklist of keys that failed it; nothing is shared
//! between operations.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Domain prefix for bootstrap key derivation.
const BOOTSTRAP_KEY_DOMAIN: &[u8] = b"skipmesh-bootstrap-v1:";

/// A 256-bit unsigned integer (big-endian) naming one bootstrap slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BootstrapId([u8; 32]);

impl BootstrapId {
    /// Derive the identifier for pool slot `index`.
    pub fn for_index(index: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(BOOTSTRAP_KEY_DOMAIN);
        hasher.update(&index.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for BootstrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootstrapId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for BootstrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Every valid bootstrap identifier for an overlay of `population` nodes.
pub fn pool(population: usize) -> Vec<BootstrapId> {
    (0..population as u64).map(BootstrapId::for_index).collect()
}

/// A resolved candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub id: BootstrapId,
    /// The blacklist covered the whole pool and was cleared to produce `id`.
    pub recycled: bool,
}

pub struct BootstrapResolver {
    rng: Mutex<StdRng>,
}

impl Default for BootstrapResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapResolver {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Resolver with a fixed seed, for reproducible simulations.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniformly pick an identifier from the pool that is not in `excluding`.
    pub fn pick(&self, population: usize, excluding: &HashSet<BootstrapId>) -> Option<BootstrapId> {
        let survivors: Vec<BootstrapId> = pool(population)
            .into_iter()
            .filter(|id| !excluding.contains(id))
            .collect();
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        survivors.choose(&mut *rng).copied()
    }

    /// Pick a candidate, clearing `blacklist` once if it has exhausted the
    /// pool. Returns `None` only when the pool itself is empty.
    pub fn resolve_entry_point(
        &self,
        population: usize,
        blacklist: &mut HashSet<BootstrapId>,
    ) -> Option<Resolution> {
        if let Some(id) = self.pick(population, blacklist) {
            return Some(Resolution { id, recycled: false });
        }
        if population == 0 {
            return None;
        }
        blacklist.clear();
        self.pick(population, blacklist)
            .map(|id| Resolution { id, recycled: true })
    }
}
