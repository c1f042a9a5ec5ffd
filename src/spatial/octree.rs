//! Loose octree of groups holding entry ids.
//!
//! An entry lives in the deepest cell whose half-size still covers the
//! entry's size, chosen by the entry's center. Entries centered outside the
//! root cell stay in the root. Each group tracks the union of its own
//! entries' extents and the union of its whole subtree.

use crate::core::arena::{Arena, Id};
use crate::core::types::Vec3;
use crate::entry::EntryId;
use crate::math::Aabb;
use crate::spatial::occlusion::{self, GroupVisibility, OcclusionState, LOD_PERIOD};

/// Handle to an octree group
pub type GroupId = Id<Group>;

/// Maximum subdivision depth below the root
pub const MAX_DEPTH: u8 = 8;

/// One octree cell with the entries stored at it
#[derive(Debug)]
pub struct Group {
    bounds: Aabb,
    depth: u8,
    parent: Option<GroupId>,
    children: [Option<GroupId>; 8],
    entries: Vec<(EntryId, Aabb)>,
    object_extents: Option<Aabb>,
    extents: Option<Aabb>,
    pub(crate) any_visible_frame: u32,
    pub(crate) occlusion: OcclusionState,
    lod_hash: u32,
}

impl Group {
    fn new(bounds: Aabb, depth: u8, parent: Option<GroupId>, lod_hash: u32) -> Self {
        Self {
            bounds,
            depth,
            parent,
            children: [None; 8],
            entries: Vec::new(),
            object_extents: None,
            extents: None,
            any_visible_frame: 0,
            occlusion: OcclusionState::Unchecked,
            lod_hash,
        }
    }

    /// Cell bounds
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn parent(&self) -> Option<GroupId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.children.iter().flatten().copied()
    }

    pub fn has_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    pub fn entries(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Union of the extents of entries stored in this group
    pub fn object_extents(&self) -> Option<Aabb> {
        self.object_extents
    }

    /// Union of the extents of every entry in this subtree
    pub fn extents(&self) -> Option<Aabb> {
        self.extents
    }

    pub fn occlusion(&self) -> OcclusionState {
        self.occlusion
    }

    pub fn lod_hash(&self) -> u32 {
        self.lod_hash
    }

    pub fn needs_update(&self, frame: u32) -> bool {
        occlusion::needs_update(self.lod_hash, frame)
    }

    pub fn visibility(&self) -> GroupVisibility {
        GroupVisibility {
            any_visible_frame: self.any_visible_frame,
            occluded: self.occlusion.is_occluded(),
        }
    }

    pub fn is_recently_visible(&self, frame: u32) -> bool {
        self.visibility().is_recently_visible(frame)
    }
}

/// Octree over one region
pub struct Octree {
    groups: Arena<Group>,
    root: GroupId,
    lod_seed: u32,
    dirty: bool,
}

impl Octree {
    pub fn new(bounds: Aabb) -> Self {
        let mut groups = Arena::new();
        let root = groups.insert(Group::new(bounds, 0, None, 0));
        Self {
            groups,
            root,
            lod_seed: 0,
            dirty: false,
        }
    }

    pub fn root(&self) -> GroupId {
        self.root
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(id)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &Group)> {
        self.groups.iter()
    }

    /// Store an entry and return the group it landed in
    pub fn insert(&mut self, id: EntryId, extents: Aabb, center: Vec3) -> GroupId {
        let size = extents.half_extent().max_element();
        let mut current = self.root;

        let root_bounds = self.groups.get(self.root).map(|g| g.bounds);
        if root_bounds.is_some_and(|b| b.contains_point(center)) {
            loop {
                let Some(group) = self.groups.get(current) else {
                    break;
                };
                if group.depth >= MAX_DEPTH {
                    break;
                }
                let octant = group.bounds.octant_of(center);
                let child_bounds = group.bounds.child_octant(octant);
                if child_bounds.half_extent().x < size {
                    break;
                }

                let existing = group.children[octant as usize];
                current = match existing {
                    Some(child) => child,
                    None => self.create_child(current, octant, child_bounds),
                };
            }
        }

        if let Some(group) = self.groups.get_mut(current) {
            group.entries.push((id, extents));
        }
        self.dirty = true;
        current
    }

    /// Remove an entry from `group`, pruning groups left empty
    pub fn remove(&mut self, group: GroupId, id: EntryId) -> bool {
        let Some(g) = self.groups.get_mut(group) else {
            return false;
        };
        let before = g.entries.len();
        g.entries.retain(|(e, _)| *e != id);
        if before == g.entries.len() {
            return false;
        }
        self.dirty = true;
        self.prune(group);
        true
    }

    /// Recompute group extents if anything moved since the last call
    pub fn rebound(&mut self) {
        if self.dirty {
            self.rebound_group(self.root);
            self.dirty = false;
        }
    }

    fn rebound_group(&mut self, id: GroupId) -> Option<Aabb> {
        let (children, object_extents) = {
            let group = self.groups.get(id)?;
            let object_extents = group
                .entries
                .iter()
                .map(|(_, ext)| *ext)
                .reduce(|a, b| a.merged(&b));
            (group.children().collect::<Vec<_>>(), object_extents)
        };

        let mut extents = object_extents;
        for child in children {
            if let Some(child_ext) = self.rebound_group(child) {
                extents = Some(match extents {
                    Some(ext) => ext.merged(&child_ext),
                    None => child_ext,
                });
            }
        }

        let group = self.groups.get_mut(id)?;
        group.object_extents = object_extents;
        group.extents = extents;
        extents
    }

    fn create_child(&mut self, parent: GroupId, octant: u8, bounds: Aabb) -> GroupId {
        self.lod_seed = (self.lod_seed + 1) % LOD_PERIOD;
        let depth = self.groups.get(parent).map_or(0, |p| p.depth + 1);
        let child = self.groups.insert(Group::new(bounds, depth, Some(parent), self.lod_seed));
        if let Some(p) = self.groups.get_mut(parent) {
            p.children[octant as usize] = Some(child);
        }
        child
    }

    fn prune(&mut self, mut id: GroupId) {
        loop {
            let Some(group) = self.groups.get(id) else {
                return;
            };
            let Some(parent) = group.parent else {
                return;
            };
            if !group.entries.is_empty() || group.has_children() {
                return;
            }

            self.groups.remove(id);
            if let Some(p) = self.groups.get_mut(parent) {
                for slot in p.children.iter_mut() {
                    if *slot == Some(id) {
                        *slot = None;
                    }
                }
            }
            id = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arena::Arena;

    fn ids(n: usize) -> Vec<EntryId> {
        let mut arena = Arena::new();
        (0..n)
            .map(|i| arena.insert(crate::entry::CacheEntry::from_update(i as u32, 0, vec![0])))
            .collect()
    }

    fn root_bounds() -> Aabb {
        Aabb::new(Vec3::ZERO, Vec3::splat(256.0))
    }

    #[test]
    fn test_small_entries_go_deep() {
        let mut tree = Octree::new(root_bounds());
        let id = ids(1)[0];
        let ext = Aabb::from_center_half_extent(Vec3::splat(10.0), Vec3::splat(0.5));
        let group = tree.insert(id, ext, ext.center());
        assert_ne!(group, tree.root());
        assert!(tree.group(group).unwrap().depth() > 3);
        assert!(tree.group(group).unwrap().bounds().contains_point(ext.center()));
    }

    #[test]
    fn test_large_and_outside_entries_stay_high() {
        let mut tree = Octree::new(root_bounds());
        let id = ids(2);
        let big = Aabb::from_center_half_extent(Vec3::splat(128.0), Vec3::splat(100.0));
        assert_eq!(tree.insert(id[0], big, big.center()), tree.root());

        let outside = Aabb::from_center_half_extent(Vec3::new(128.0, 128.0, 3000.0), Vec3::ONE);
        assert_eq!(tree.insert(id[1], outside, outside.center()), tree.root());
    }

    #[test]
    fn test_rebound_and_prune() {
        let mut tree = Octree::new(root_bounds());
        let id = ids(2);
        let a = Aabb::from_center_half_extent(Vec3::splat(10.0), Vec3::ONE);
        let b = Aabb::from_center_half_extent(Vec3::splat(200.0), Vec3::ONE);
        let ga = tree.insert(id[0], a, a.center());
        let gb = tree.insert(id[1], b, b.center());
        tree.rebound();

        let root_ext = tree.group(tree.root()).unwrap().extents().unwrap();
        assert!(root_ext.contains(&a) && root_ext.contains(&b));
        assert_eq!(tree.group(ga).unwrap().object_extents(), Some(a));

        let groups_before = tree.group_count();
        assert!(tree.remove(ga, id[0]));
        assert!(!tree.remove(ga, id[0]));
        assert!(tree.group_count() < groups_before);
        assert!(tree.group(ga).is_none());

        tree.rebound();
        assert_eq!(tree.group(tree.root()).unwrap().extents(), Some(b));
        assert!(tree.group(gb).is_some());
    }

    #[test]
    fn test_lod_hashes_spread() {
        let mut tree = Octree::new(root_bounds());
        let id = ids(8);
        for (i, e) in id.iter().enumerate() {
            let c = Vec3::new(10.0 + 30.0 * i as f32, 10.0, 10.0);
            tree.insert(*e, Aabb::from_center_half_extent(c, Vec3::splat(0.25)), c);
        }
        let hashes: std::collections::HashSet<u32> = tree.iter().map(|(_, g)| g.lod_hash()).collect();
        assert!(hashes.len() > 4);
    }
}
