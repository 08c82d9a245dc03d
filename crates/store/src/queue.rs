//! Tiered queue of recorded store writes.
//!
//! Three FIFO lanes, one per [`Tier`]. The core lane is unbounded and keeps
//! every write. The aux and noise lanes coalesce writes to the same key (the
//! newer write takes the older one's place) and are bounded: when a lane is
//! full its oldest entry is dropped. Draining takes weighted rounds so core
//! writes go first without starving the other lanes.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use perch_core::config::QueueConfig;
use perch_core::{StoreChange, Tier};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

/// Entries taken from each lane per drain round.
const ROUND_WEIGHTS: [(Tier, usize); 3] = [(Tier::Core, 8), (Tier::Aux, 2), (Tier::Noise, 1)];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub core: usize,
    pub aux: usize,
    pub noise: usize,
    pub dropped_aux: u64,
    pub dropped_noise: u64,
    pub coalesced: u64,
}

#[derive(Default)]
struct Lane {
    entries: VecDeque<StoreChange>,
    keys: HashSet<String>,
    capacity: Option<usize>,
    dropped: u64,
    coalesced: u64,
}

impl Lane {
    fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    fn push(&mut self, change: StoreChange) {
        let Some(capacity) = self.capacity else {
            self.entries.push_back(change);
            return;
        };

        if self.keys.contains(&change.key) {
            if let Some(slot) = self.entries.iter_mut().find(|entry| entry.key == change.key) {
                *slot = change;
                self.coalesced += 1;
                return;
            }
        }

        if self.entries.len() >= capacity {
            if let Some(oldest) = self.entries.pop_front() {
                self.keys.remove(&oldest.key);
                self.dropped += 1;
            }
        }
        self.keys.insert(change.key.clone());
        self.entries.push_back(change);
    }

    fn pop(&mut self) -> Option<StoreChange> {
        let change = self.entries.pop_front()?;
        if self.capacity.is_some() {
            self.keys.remove(&change.key);
        }
        Some(change)
    }
}

struct Lanes {
    core: Lane,
    aux: Lane,
    noise: Lane,
}

impl Lanes {
    fn lane_mut(&mut self, tier: Tier) -> &mut Lane {
        match tier {
            Tier::Core => &mut self.core,
            Tier::Aux => &mut self.aux,
            Tier::Noise => &mut self.noise,
        }
    }

    fn lane(&self, tier: Tier) -> &Lane {
        match tier {
            Tier::Core => &self.core,
            Tier::Aux => &self.aux,
            Tier::Noise => &self.noise,
        }
    }

    fn len(&self) -> usize {
        self.core.entries.len() + self.aux.entries.len() + self.noise.entries.len()
    }
}

pub struct PriorityQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl PriorityQueue {
    pub fn new(aux_capacity: usize, noise_capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                core: Lane::default(),
                aux: Lane::bounded(aux_capacity),
                noise: Lane::bounded(noise_capacity),
            }),
            notify: Notify::new(),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.aux_capacity, config.noise_capacity)
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, change: StoreChange) {
        let tier = change.tier();
        trace!(key = %change.key, tier = tier.as_str(), "queued store change");
        self.lanes().lane_mut(tier).push(change);
        self.notify.notify_one();
    }

    /// Take up to `max` entries in weighted rounds.
    pub fn drain(&self, max: usize) -> Vec<StoreChange> {
        let mut lanes = self.lanes();
        let mut batch = Vec::with_capacity(max.min(lanes.len()));

        while batch.len() < max && lanes.len() > 0 {
            for (tier, weight) in ROUND_WEIGHTS {
                let lane = lanes.lane_mut(tier);
                for _ in 0..weight {
                    if batch.len() >= max {
                        break;
                    }
                    match lane.pop() {
                        Some(change) => batch.push(change),
                        None => break,
                    }
                }
            }
        }

        batch
    }

    /// Wait until at least one entry is queued, then drain up to `max`.
    pub async fn recv(&self, max: usize) -> Vec<StoreChange> {
        loop {
            let batch = self.drain(max.max(1));
            if !batch.is_empty() {
                return batch;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lanes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, tier: Tier) -> usize {
        self.lanes().lane(tier).entries.len()
    }

    pub fn stats(&self) -> QueueStats {
        let lanes = self.lanes();
        QueueStats {
            core: lanes.core.entries.len(),
            aux: lanes.aux.entries.len(),
            noise: lanes.noise.entries.len(),
            dropped_aux: lanes.aux.dropped,
            dropped_noise: lanes.noise.dropped,
            coalesced: lanes.aux.coalesced + lanes.noise.coalesced,
        }
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}
