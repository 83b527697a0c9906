//! Stable network IDs for authority-local entities

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque handle to an entity in the host's own world (arena index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalRef(pub u64);

/// Bidirectional map between local refs and wire IDs
///
/// IDs are `<prefix>_<n>` with `n` increasing for the whole session, so a
/// released ID is never handed to another entity.
#[derive(Debug)]
pub struct EntityIdRegistry {
    prefix: String,
    next_index: u64,
    by_ref: HashMap<LocalRef, String>,
    by_id: HashMap<String, LocalRef>,
}

impl EntityIdRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next_index: 1,
            by_ref: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Network ID for `local`, assigning one on first use
    pub fn id_for(&mut self, local: LocalRef) -> String {
        if let Some(network_id) = self.by_ref.get(&local) {
            return network_id.clone();
        }

        let network_id = format!("{}_{}", self.prefix, self.next_index);
        self.next_index += 1;
        self.by_id.insert(network_id.clone(), local);
        self.by_ref.insert(local, network_id.clone());
        network_id
    }

    /// Existing network ID, without assigning
    pub fn network_id(&self, local: LocalRef) -> Option<&str> {
        self.by_ref.get(&local).map(String::as_str)
    }

    pub fn lookup(&self, network_id: &str) -> Option<LocalRef> {
        self.by_id.get(network_id).copied()
    }

    /// Forget `local`; returns the ID it had
    pub fn release(&mut self, local: LocalRef) -> Option<String> {
        let network_id = self.by_ref.remove(&local)?;
        self.by_id.remove(&network_id);
        Some(network_id)
    }

    /// Refs currently registered
    pub fn refs(&self) -> impl Iterator<Item = LocalRef> + '_ {
        self.by_ref.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    /// Drop every entry; the counter keeps running
    pub fn clear(&mut self) {
        self.by_ref.clear();
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_assignment_is_idempotent() {
        let mut registry = EntityIdRegistry::new("enemy");
        let a = LocalRef(10);
        let first = registry.id_for(a);
        assert_eq!(first, "enemy_1");
        assert_eq!(registry.id_for(a), first);
        assert_eq!(registry.lookup(&first), Some(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_frees_lookup() {
        let mut registry = EntityIdRegistry::new("enemy");
        let a = LocalRef(10);
        let id = registry.id_for(a);

        assert_eq!(registry.release(a), Some(id.clone()));
        assert_eq!(registry.lookup(&id), None);
        assert_eq!(registry.network_id(a), None);
        assert_eq!(registry.release(a), None);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut registry = EntityIdRegistry::new("enemy");
        let first = registry.id_for(LocalRef(1));
        registry.release(LocalRef(1));
        registry.clear();

        // Same local ref after release is a new entity
        let second = registry.id_for(LocalRef(1));
        assert_ne!(first, second);
        assert_eq!(second, "enemy_2");
    }
}
