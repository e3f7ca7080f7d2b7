use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::strategy::types::{underlying_symbol, PositionSide};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: &str, side: PositionSide) -> Self {
        Self { symbol: underlying_symbol(symbol), side }
    }
}

#[derive(Debug)]
struct Registration {
    id: u64,
    token: CancellationToken,
}

#[derive(Debug)]
struct RegistryInner {
    root: CancellationToken,
    entries: DashMap<PositionKey, Vec<Registration>>,
    next_id: AtomicU64,
}

/// In-memory set of positions whose monitors are currently running.
///
/// Each registration owns a child of the registry's root token, so a single
/// position can be released on its own and `shutdown` stops everything.
#[derive(Debug, Clone)]
pub struct PositionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                root: CancellationToken::new(),
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register monitors for `key`.
    ///
    /// With `dedupe` set, returns `None` when the key already has live monitors.
    pub fn try_register(&self, key: PositionKey, dedupe: bool) -> Option<MonitorLease> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();

        match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if dedupe && !occupied.get().is_empty() {
                    return None;
                }
                occupied.get_mut().push(Registration { id, token: token.clone() });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![Registration { id, token: token.clone() }]);
            }
        }

        Some(MonitorLease {
            registry: Arc::clone(&self.inner),
            key,
            id,
            token,
        })
    }

    pub fn is_managed(&self, symbol: &str, side: PositionSide) -> bool {
        self.inner
            .entries
            .get(&PositionKey::new(symbol, side))
            .map(|regs| !regs.is_empty())
            .unwrap_or(false)
    }

    /// Number of live registrations across all positions.
    pub fn active_count(&self) -> usize {
        self.inner.entries.iter().map(|e| e.value().len()).sum()
    }

    /// Cancel every monitor of one position. Returns how many registrations were stopped.
    pub fn release(&self, symbol: &str, side: PositionSide) -> usize {
        match self.inner.entries.remove(&PositionKey::new(symbol, side)) {
            Some((_, regs)) => {
                for reg in &regs {
                    reg.token.cancel();
                }
                regs.len()
            }
            None => 0,
        }
    }

    /// Cancel every monitor.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.entries.clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

/// Proof of registration shared by the monitors of one position.
///
/// Dropping the last clone (both monitors finished) removes the registration.
#[derive(Debug)]
pub struct MonitorLease {
    registry: Arc<RegistryInner>,
    key: PositionKey,
    id: u64,
    token: CancellationToken,
}

impl MonitorLease {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        let id = self.id;
        if let Some(mut regs) = self.registry.entries.get_mut(&self.key) {
            regs.retain(|r| r.id != id);
        }
        self.registry.entries.remove_if(&self.key, |_, regs| regs.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let registry = PositionRegistry::new();
        let lease = registry
            .try_register(PositionKey::new("BTCUSDT.P", PositionSide::Long), false)
            .unwrap();
        assert!(registry.is_managed("BTCUSDT", PositionSide::Long));
        assert!(!registry.is_managed("BTCUSDT", PositionSide::Short));

        drop(lease);
        assert!(!registry.is_managed("BTCUSDT", PositionSide::Long));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_dedupe_blocks_second_registration() {
        let registry = PositionRegistry::new();
        let key = PositionKey::new("ETHUSDT", PositionSide::Short);

        let _first = registry.try_register(key.clone(), true).unwrap();
        assert!(registry.try_register(key.clone(), true).is_none());

        // Without dedupe duplicates are tolerated.
        let _second = registry.try_register(key, false).unwrap();
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_release_cancels_only_that_position() {
        let registry = PositionRegistry::new();
        let btc = registry.try_register(PositionKey::new("BTCUSDT", PositionSide::Long), false).unwrap();
        let eth = registry.try_register(PositionKey::new("ETHUSDT", PositionSide::Long), false).unwrap();

        assert_eq!(registry.release("BTCUSDT", PositionSide::Long), 1);
        assert!(btc.token().is_cancelled());
        assert!(!eth.token().is_cancelled());

        registry.shutdown();
        assert!(eth.token().is_cancelled());
        assert!(registry.is_shutdown());
    }
}
