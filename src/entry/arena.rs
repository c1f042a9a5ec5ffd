//! Region-owned storage for cache entries and their parent/child links.
//!
//! Children hold their parent's local id; parents hold child ids. A child
//! whose parent has not arrived yet is parked as an orphan and attached when
//! the parent is inserted. Hierarchies are one level deep: an entry that
//! becomes a child releases its own children back to roots.

use std::collections::HashMap;

use crate::core::arena::{Arena, Id};
use crate::core::types::Vec3;
use crate::entry::cache_entry::CacheEntry;
use crate::entry::EntryMap;

/// Handle to an entry inside an [`EntryArena`]
pub type EntryId = Id<CacheEntry>;

/// Owner of every cache entry of one region
#[derive(Default)]
pub struct EntryArena {
    entries: Arena<CacheEntry>,
    by_local_id: HashMap<u32, EntryId>,
    /// Children waiting for their parent, keyed by parent local id
    orphans: HashMap<u32, Vec<EntryId>>,
    /// Entries whose bounds or root status changed since the last drain
    changed: Vec<EntryId>,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from a loaded entry map (all entries start as roots)
    pub fn from_entry_map(map: EntryMap) -> Self {
        let mut arena = Self::new();
        for (_, entry) in map {
            arena.insert(entry);
        }
        arena
    }

    /// Store an entry, replacing any entry with the same local id.
    ///
    /// Pending orphans of this id are attached, and the entry itself is
    /// attached to its parent (or parked) when it names one.
    pub fn insert(&mut self, mut entry: CacheEntry) -> EntryId {
        let local_id = entry.local_id();
        if let Some(old) = self.by_local_id.get(&local_id).copied() {
            self.remove(old);
        }

        let parent_id = entry.parent_id();
        entry.children.clear();
        entry.group = None;
        entry.set_in_spatial_index(false);
        let id = self.entries.insert(entry);
        self.by_local_id.insert(local_id, id);
        self.changed.push(id);

        if let Some(waiting) = self.orphans.remove(&local_id) {
            for child in waiting {
                self.attach_child(id, child);
            }
            self.recompute_bounds(id);
        }

        if parent_id != 0 {
            self.link_to_parent(id, parent_id);
        }
        id
    }

    /// Remove an entry. Its children become roots and it leaves its parent.
    pub fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let parent_id = self.entries.get(id)?.parent_id();
        self.unlink_from_parent(id, parent_id);

        let mut entry = self.entries.remove(id)?;
        self.by_local_id.remove(&entry.local_id());
        for child in std::mem::take(&mut entry.children) {
            self.release_child(child);
        }
        self.changed.retain(|c| *c != id);
        Some(entry)
    }

    /// Change an entry's parent (0 = root).
    pub fn set_parent(&mut self, id: EntryId, parent_id: u32) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let old_parent = entry.parent_id();
        if old_parent == parent_id {
            return;
        }

        self.unlink_from_parent(id, old_parent);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.set_parent_id(parent_id);
        }
        self.changed.push(id);

        if parent_id != 0 {
            let released = self
                .entries
                .get_mut(id)
                .map(|e| std::mem::take(&mut e.children))
                .unwrap_or_default();
            if !released.is_empty() {
                for child in released {
                    self.release_child(child);
                }
                self.recompute_bounds(id);
            }
            self.link_to_parent(id, parent_id);
        }
    }

    /// Update an entry's position and scale, then its parent's bounds
    pub fn set_bounding_info(&mut self, id: EntryId, position: Vec3, scale: Vec3) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.set_bounding_info(position, scale);
        let parent_id = entry.parent_id();
        self.recompute_bounds(id);

        if let Some(parent) = self.by_local_id.get(&parent_id).copied() {
            self.recompute_bounds(parent);
        }
    }

    /// Take the list of entries whose bounds or root status changed
    pub fn drain_changed(&mut self) -> Vec<EntryId> {
        let mut changed = std::mem::take(&mut self.changed);
        changed.sort();
        changed.dedup();
        changed
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(id)
    }

    pub fn id_of(&self, local_id: u32) -> Option<EntryId> {
        self.by_local_id.get(&local_id).copied()
    }

    pub fn by_local_id(&self, local_id: u32) -> Option<&CacheEntry> {
        self.id_of(local_id).and_then(|id| self.entries.get(id))
    }

    /// Entries still waiting for `parent_id` to arrive
    pub fn orphans_of(&self, parent_id: u32) -> &[EntryId] {
        self.orphans.get(&parent_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.entries.iter()
    }

    /// Consume the arena into a map keyed by local id
    pub fn into_entry_map(mut self) -> EntryMap {
        self.entries
            .drain()
            .map(|entry| (entry.local_id(), entry))
            .collect()
    }

    fn link_to_parent(&mut self, id: EntryId, parent_id: u32) {
        match self.by_local_id.get(&parent_id).copied() {
            Some(parent) if parent != id => {
                self.attach_child(parent, id);
                self.recompute_bounds(parent);
            }
            _ => self.orphans.entry(parent_id).or_default().push(id),
        }
    }

    fn unlink_from_parent(&mut self, id: EntryId, parent_id: u32) {
        if parent_id == 0 {
            return;
        }
        if let Some(parent) = self.by_local_id.get(&parent_id).copied() {
            let detached = match self.entries.get_mut(parent) {
                Some(p) => {
                    let before = p.children.len();
                    p.children.retain(|c| *c != id);
                    before != p.children.len()
                }
                None => false,
            };
            if detached {
                self.recompute_bounds(parent);
            }
        }
        if let Some(waiting) = self.orphans.get_mut(&parent_id) {
            waiting.retain(|c| *c != id);
            if waiting.is_empty() {
                self.orphans.remove(&parent_id);
            }
        }
    }

    fn attach_child(&mut self, parent: EntryId, child: EntryId) {
        // A child cannot keep children of its own.
        let released = self
            .entries
            .get_mut(child)
            .map(|c| std::mem::take(&mut c.children))
            .unwrap_or_default();
        if !released.is_empty() {
            for grandchild in released {
                self.release_child(grandchild);
            }
            self.recompute_bounds(child);
        }

        if let Some(p) = self.entries.get_mut(parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
        self.changed.push(child);
    }

    fn release_child(&mut self, child: EntryId) {
        if let Some(c) = self.entries.get_mut(child) {
            c.set_parent_id(0);
            self.changed.push(child);
        }
    }

    fn recompute_bounds(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let child_extents: Vec<_> = entry
            .children
            .iter()
            .filter_map(|c| self.entries.get(*c).map(|c| c.extents()))
            .collect();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.update_parent_bounds(child_extents);
        }
        self.changed.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use rand::Rng;

    fn entry(local_id: u32) -> CacheEntry {
        CacheEntry::from_update(local_id, local_id, vec![local_id as u8; 4])
    }

    fn child_of(local_id: u32, parent_id: u32) -> CacheEntry {
        let mut e = entry(local_id);
        e.set_parent_id(parent_id);
        e
    }

    fn contains_approx(outer: &Aabb, inner: &Aabb) -> bool {
        let eps = 1e-3;
        (inner.min - outer.min).min_element() >= -eps && (outer.max - inner.max).min_element() >= -eps
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut arena = EntryArena::new();
        let a = arena.insert(entry(5));
        let b = arena.insert(entry(9));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.id_of(5), Some(a));
        assert_eq!(arena.by_local_id(9).map(|e| e.local_id()), Some(9));

        // Same local id replaces
        let c = arena.insert(entry(5));
        assert_eq!(arena.len(), 2);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.id_of(5), Some(c));
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn test_orphan_attached_when_parent_arrives() {
        let mut arena = EntryArena::new();
        let child = arena.insert(child_of(2, 1));
        assert_eq!(arena.orphans_of(1), &[child]);

        let parent = arena.insert(entry(1));
        assert!(arena.orphans_of(1).is_empty());
        assert_eq!(arena.get(parent).unwrap().children(), &[child]);
    }

    #[test]
    fn test_set_parent_moves_child() {
        let mut arena = EntryArena::new();
        let p1 = arena.insert(entry(1));
        let p2 = arena.insert(entry(2));
        let c = arena.insert(entry(3));
        arena.drain_changed();

        arena.set_parent(c, 1);
        assert_eq!(arena.get(p1).unwrap().children(), &[c]);
        let changed = arena.drain_changed();
        assert!(changed.contains(&c));
        assert!(changed.contains(&p1));

        arena.set_parent(c, 2);
        assert!(arena.get(p1).unwrap().children().is_empty());
        assert_eq!(arena.get(p2).unwrap().children(), &[c]);

        arena.set_parent(c, 0);
        assert!(arena.get(p2).unwrap().children().is_empty());
        assert_eq!(arena.get(c).unwrap().parent_id(), 0);
    }

    #[test]
    fn test_new_child_releases_its_children() {
        let mut arena = EntryArena::new();
        let a = arena.insert(entry(1));
        let b = arena.insert(entry(2));
        let grandchild = arena.insert(child_of(3, 2));
        assert_eq!(arena.get(b).unwrap().children(), &[grandchild]);

        arena.set_parent(b, 1);
        assert!(arena.get(b).unwrap().children().is_empty());
        assert_eq!(arena.get(grandchild).unwrap().parent_id(), 0);
        assert_eq!(arena.get(a).unwrap().children(), &[b]);
    }

    #[test]
    fn test_remove_parent_releases_children() {
        let mut arena = EntryArena::new();
        let p = arena.insert(entry(1));
        let c = arena.insert(child_of(2, 1));
        let removed = arena.remove(p).unwrap();
        assert_eq!(removed.local_id(), 1);
        assert!(removed.children().is_empty());
        assert_eq!(arena.get(c).unwrap().parent_id(), 0);
        assert_eq!(arena.id_of(1), None);
    }

    #[test]
    fn test_parent_bounds_contain_random_children() {
        let mut rng = rand::thread_rng();
        let mut arena = EntryArena::new();
        let parent_pos = Vec3::new(128.0, 64.0, 30.0);
        let parent = arena.insert(entry(1));
        arena.set_bounding_info(parent, parent_pos, Vec3::splat(0.5));

        let mut children = Vec::new();
        for local_id in 2..102 {
            let id = arena.insert(child_of(local_id, 1));
            let pos = Vec3::new(
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-50.0..50.0),
                rng.gen_range(-20.0..20.0),
            );
            let scale = Vec3::new(
                rng.gen_range(0.01..8.0),
                rng.gen_range(0.01..8.0),
                rng.gen_range(0.01..8.0),
            );
            arena.set_bounding_info(id, pos, scale);
            children.push(id);
        }

        // Move a few children after the fact
        for id in children.iter().take(10) {
            arena.set_bounding_info(*id, Vec3::new(-60.0, 10.0, 5.0), Vec3::ONE);
        }

        let p = arena.get(parent).unwrap();
        assert_eq!(p.children().len(), 100);
        let bounds = p.extents();
        assert!(contains_approx(&bounds, &p.base_extents()));
        for id in &children {
            let child_ext = arena.get(*id).unwrap().extents().translated(parent_pos);
            assert!(contains_approx(&bounds, &child_ext));
        }
        assert!((p.position() - bounds.center()).length() < 1e-3);
        assert!(p.bin_radius() <= 256.0);

        // Removing every child shrinks back to the base extents
        for id in children {
            arena.set_parent(id, 0);
        }
        let p = arena.get(parent).unwrap();
        assert_eq!(p.extents(), p.base_extents());
        assert_eq!(p.position(), parent_pos);
    }

    #[test]
    fn test_into_entry_map() {
        let mut arena = EntryArena::new();
        arena.insert(entry(9));
        arena.insert(entry(5));
        let map = arena.into_entry_map();
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), vec![5, 9]);
    }
}
