use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use perch_core::jid;
use tracing::debug;

#[derive(Debug, Default)]
struct Pairs {
    lid_to_pn: HashMap<String, String>,
    pn_to_lid: HashMap<String, String>,
}

/// Known pairs of linked identifier and phone-number identifier for the same
/// participant. Lookups are explicit; nothing is merged automatically.
///
/// Both directions live under one lock so every reader sees them as exact
/// inverses of each other.
#[derive(Debug, Default)]
pub struct AliasMap {
    pairs: RwLock<Pairs>,
}

impl AliasMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Pairs> {
        self.pairs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Pairs> {
        self.pairs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `lid` and `phone_number` name the same participant. Either
    /// argument order is accepted; a pair without exactly one linked form is
    /// ignored. Returns whether the pair was recorded.
    pub fn record(&self, a: &str, b: &str) -> bool {
        let a = jid::normalize(a);
        let b = jid::normalize(b);
        let (lid, pn) = match (jid::is_linked(&a), jid::is_linked(&b)) {
            (true, false) => (a, b),
            (false, true) => (b, a),
            _ => return false,
        };

        {
            let mut pairs = self.write();
            if let Some(previous) = pairs.lid_to_pn.insert(lid.clone(), pn.clone()) {
                if previous != pn {
                    pairs.pn_to_lid.remove(&previous);
                }
            }
            if let Some(previous) = pairs.pn_to_lid.insert(pn.clone(), lid.clone()) {
                if previous != lid {
                    pairs.lid_to_pn.remove(&previous);
                }
            }
        }
        debug!(lid = %lid, pn = %pn, "recorded identity alias");
        true
    }

    /// The other form of `id`, if a mapping is known.
    pub fn resolve(&self, id: &str) -> Option<String> {
        let id = jid::normalize(id);
        let pairs = self.read();
        if jid::is_linked(&id) {
            pairs.lid_to_pn.get(&id).cloned()
        } else {
            pairs.pn_to_lid.get(&id).cloned()
        }
    }

    pub fn len(&self) -> usize {
        self.read().lid_to_pn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().lid_to_pn.is_empty()
    }
}
