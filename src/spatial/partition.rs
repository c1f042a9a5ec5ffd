//! Per-region spatial index over arena entries

use crate::core::camera::CullCamera;
use crate::core::settings::CullParameters;
use crate::core::types::Vec3;
use crate::entry::{EntryArena, EntryId};
use crate::math::Aabb;
use crate::spatial::cull::{BackCull, FrontCull};
use crate::spatial::occlusion::{GroupVisibility, OcclusionState, LOD_PERIOD};
use crate::spatial::octree::{Group, GroupId, Octree};

/// Default root cell: one region wide, tall enough for most builds
pub fn region_root_bounds() -> Aabb {
    Aabb::from_center_half_extent(Vec3::new(128.0, 128.0, 256.0), Vec3::splat(256.0))
}

/// What a call to [`SpatialIndex::cull`] did this frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CullOutcome {
    /// Already culled on this frame
    Skipped,
    /// Full frustum pass
    Front(Vec<GroupId>),
    /// Idle camera: only the back-sphere pass ran
    Back(Vec<GroupId>),
}

impl CullOutcome {
    pub fn groups(&self) -> &[GroupId] {
        match self {
            CullOutcome::Skipped => &[],
            CullOutcome::Front(groups) | CullOutcome::Back(groups) => groups,
        }
    }
}

/// Octree index of one region's root entries plus culling state
pub struct SpatialIndex {
    tree: Octree,
    count: usize,
    last_cull_frame: u32,
    /// One bit per frame, set when new objects arrived
    cull_history: u32,
    idle_hash: u32,
    /// Remaining back passes while idle; `None` until first needed
    back_budget: Option<u32>,
    pending: Vec<GroupId>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::with_bounds(region_root_bounds())
    }

    pub fn with_bounds(bounds: Aabb) -> Self {
        Self {
            tree: Octree::new(bounds),
            count: 0,
            last_cull_frame: 0,
            cull_history: u32::MAX,
            idle_hash: 0,
            back_budget: None,
            pending: Vec::new(),
        }
    }

    /// Index an entry. Entries with non-finite bounds are refused and the
    /// index is left untouched.
    pub fn insert(&mut self, arena: &mut EntryArena, id: EntryId) -> bool {
        let Some(entry) = arena.get(id) else {
            return false;
        };
        if !entry.has_finite_bounds() {
            log::warn!("Refusing to index object {} with non-finite bounds", entry.local_id());
            return false;
        }
        if entry.in_spatial_index() {
            self.remove(arena, id);
        }
        let Some(entry) = arena.get_mut(id) else {
            return false;
        };

        let group = self.tree.insert(id, entry.extents(), entry.position());
        entry.set_in_spatial_index(true);
        entry.group = Some(group);
        self.count += 1;
        true
    }

    pub fn remove(&mut self, arena: &mut EntryArena, id: EntryId) -> bool {
        let Some(entry) = arena.get_mut(id) else {
            return false;
        };
        if !entry.in_spatial_index() {
            return false;
        }
        if let Some(group) = entry.group {
            self.tree.remove(group, id);
        }
        entry.set_in_spatial_index(false);
        self.count -= 1;
        true
    }

    /// Re-index after the entry's bounds changed. An entry whose new bounds
    /// are non-finite ends up out of the index.
    pub fn update(&mut self, arena: &mut EntryArena, id: EntryId) -> bool {
        self.remove(arena, id);
        self.insert(arena, id)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn octree(&self) -> &Octree {
        &self.tree
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.tree.group(id)
    }

    pub fn group_visibility(&self, id: GroupId) -> Option<GroupVisibility> {
        self.tree.group(id).map(Group::visibility)
    }

    /// Shift the new-object history by one frame
    pub fn set_cull_history(&mut self, has_new_object: bool) {
        self.cull_history = (self.cull_history << 1) | has_new_object as u32;
    }

    /// Frustum pass: groups in view and within draw distance
    pub fn cull_frustum(&mut self, camera: &CullCamera, params: &CullParameters, frame: u32) -> Vec<GroupId> {
        self.tree.rebound();
        let result = FrontCull::new(camera, params, params.use_occlusion, frame).run(&mut self.tree);
        self.pending.extend(result.new_queries);
        result.selected
    }

    /// Back pass: groups within the rear radius around the camera
    pub fn cull_back_sphere(&mut self, camera: &CullCamera, params: &CullParameters) -> Vec<GroupId> {
        self.tree.rebound();
        BackCull::new(camera, params, params.use_occlusion).run(&self.tree)
    }

    /// Once-per-frame culling with reduced work while the camera is idle
    pub fn cull(&mut self, camera: &CullCamera, params: &CullParameters, frame: u32) -> CullOutcome {
        if self.last_cull_frame == frame {
            return CullOutcome::Skipped;
        }
        self.last_cull_frame = frame;

        if self.cull_history == 0 && camera.is_static {
            let seed = (LOD_PERIOD >> 1).max(4);
            if frame % seed == 0 {
                self.idle_hash = (self.idle_hash + 1) % seed;
            }
            if frame % seed != self.idle_hash {
                return CullOutcome::Back(self.select_back_objects(camera, params));
            }
        } else {
            self.back_budget = None;
        }

        CullOutcome::Front(self.cull_frustum(camera, params, frame))
    }

    fn select_back_objects(&mut self, camera: &CullCamera, params: &CullParameters) -> Vec<GroupId> {
        let budget = *self
            .back_budget
            .get_or_insert_with(|| params.back_selection_budget());
        if budget == 0 {
            return Vec::new();
        }

        let selected = self.cull_back_sphere(camera, params);
        self.back_budget = Some(if selected.is_empty() { 0 } else { budget - 1 });
        selected
    }

    /// Groups waiting for an occlusion query, oldest request first
    pub fn pending_queries(&mut self) -> Vec<GroupId> {
        let tree = &self.tree;
        self.pending.retain(|g| {
            tree.group(*g)
                .is_some_and(|group| group.occlusion() == OcclusionState::QueryPending)
        });
        self.pending.clone()
    }

    /// Apply a query result. Returns false if the group no longer waits.
    pub fn resolve_query(&mut self, id: GroupId, occluded: bool) -> bool {
        let Some(group) = self.tree.group_mut(id) else {
            return false;
        };
        if group.occlusion != OcclusionState::QueryPending {
            return false;
        }
        group.occlusion = if occluded {
            OcclusionState::Occluded
        } else {
            OcclusionState::Visible
        };
        self.pending.retain(|g| *g != id);
        true
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::settings::CacheSettings;
    use crate::entry::CacheEntry;

    fn camera_at(z: f32) -> CullCamera {
        // Default orientation looks down -Z
        CullCamera::new(Vec3::new(128.0, 128.0, z), 60.0, 1.0, 256.0)
    }

    fn params() -> CullParameters {
        CullParameters::derive(&CacheSettings::default(), 256.0)
    }

    fn add(arena: &mut EntryArena, index: &mut SpatialIndex, local_id: u32, pos: Vec3, scale: f32) -> EntryId {
        let id = arena.insert(CacheEntry::from_update(local_id, 0, vec![1]));
        arena.set_bounding_info(id, pos, Vec3::splat(scale));
        assert!(index.insert(arena, id));
        id
    }

    fn group_of(arena: &EntryArena, id: EntryId) -> GroupId {
        arena.get(id).and_then(|e| e.group()).unwrap()
    }

    #[test]
    fn test_non_finite_insert_rejected() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        add(&mut arena, &mut index, 1, Vec3::new(10.0, 10.0, 10.0), 1.0);

        for (local_id, pos) in [(2, Vec3::new(f32::NAN, 0.0, 0.0)), (3, Vec3::splat(f32::INFINITY))] {
            let id = arena.insert(CacheEntry::from_update(local_id, 0, vec![1]));
            arena.set_bounding_info(id, pos, Vec3::ONE);
            assert!(!index.insert(&mut arena, id));
            assert!(!arena.get(id).unwrap().in_spatial_index());
        }
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_rejected_reinsert_keeps_indexed_entry() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        let id = add(&mut arena, &mut index, 1, Vec3::new(10.0, 10.0, 10.0), 1.0);
        let group = group_of(&arena, id);

        arena.set_bounding_info(id, Vec3::splat(f32::NAN), Vec3::ONE);
        assert!(!index.insert(&mut arena, id));
        assert_eq!(index.len(), 1);
        assert!(arena.get(id).unwrap().in_spatial_index());
        assert_eq!(group_of(&arena, id), group);

        // Updating drops the stale placement instead
        assert!(!index.update(&mut arena, id));
        assert!(index.is_empty());
        assert!(!arena.get(id).unwrap().in_spatial_index());
    }

    #[test]
    fn test_remove_and_update() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        let id = add(&mut arena, &mut index, 1, Vec3::new(10.0, 10.0, 10.0), 0.5);
        let before = group_of(&arena, id);

        arena.set_bounding_info(id, Vec3::new(200.0, 200.0, 50.0), Vec3::splat(0.5));
        assert!(index.update(&mut arena, id));
        assert_eq!(index.len(), 1);
        assert_ne!(group_of(&arena, id), before);

        assert!(index.remove(&mut arena, id));
        assert!(!index.remove(&mut arena, id));
        assert!(index.is_empty());
        assert!(arena.get(id).unwrap().group().is_none());
    }

    #[test]
    fn test_front_cull_selects_objects_in_view() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        let ahead = add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 10.0), 2.0);
        let behind = add(&mut arena, &mut index, 2, Vec3::new(128.0, 128.0, 200.0), 2.0);

        let selected = index.cull_frustum(&camera_at(100.0), &params(), 5);
        assert!(selected.contains(&group_of(&arena, ahead)));
        assert!(!selected.contains(&group_of(&arena, behind)));

        let vis = index.group_visibility(group_of(&arena, ahead)).unwrap();
        assert_eq!(vis.any_visible_frame, 5);
    }

    #[test]
    fn test_back_sphere_keeps_objects_behind_camera() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        let behind = add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 120.0), 2.0);
        let far = add(&mut arena, &mut index, 2, Vec3::new(128.0, 128.0, 500.0), 2.0);

        let selected = index.cull_back_sphere(&camera_at(100.0), &params());
        assert!(selected.contains(&group_of(&arena, behind)));
        assert!(!selected.contains(&group_of(&arena, far)));
    }

    #[test]
    fn test_occlusion_state_machine() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        let id = add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 10.0), 2.0);
        let camera = camera_at(100.0);
        let params = params();
        let group = group_of(&arena, id);
        let hash = index.group(group).unwrap().lod_hash();

        // First frames that do and do not re-check this group
        let quiet = (100..).find(|f| f % LOD_PERIOD != hash && (f + 1) % LOD_PERIOD != hash).unwrap();
        let recheck = (quiet..).find(|f| f % LOD_PERIOD == hash).unwrap();

        // Unseen group asks for a query and stays selected while pending
        assert!(index.cull_frustum(&camera, &params, quiet).contains(&group));
        assert_eq!(index.group(group).unwrap().occlusion(), OcclusionState::QueryPending);
        assert_eq!(index.pending_queries(), vec![group]);
        assert!(index.cull_back_sphere(&camera, &params).is_empty());

        // Occluded groups are skipped until their re-check frame
        assert!(index.resolve_query(group, true));
        assert!(!index.resolve_query(group, true));
        assert!(index.pending_queries().is_empty());
        assert!(index.group_visibility(group).unwrap().occluded);
        assert!(!index.cull_frustum(&camera, &params, quiet + 1).contains(&group));

        assert!(index.cull_frustum(&camera, &params, recheck).contains(&group));
        assert_eq!(index.group(group).unwrap().occlusion(), OcclusionState::QueryPending);

        // Visible groups seen recently do not ask again
        assert!(index.resolve_query(group, false));
        assert!(index.cull_frustum(&camera, &params, recheck + 1).contains(&group));
        assert_eq!(index.group(group).unwrap().occlusion(), OcclusionState::Visible);
        assert!(index.pending_queries().is_empty());
    }

    #[test]
    fn test_root_never_occlusion_culled() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        // Too large for any child cell
        let id = add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 10.0), 200.0);
        let group = group_of(&arena, id);
        assert_eq!(group, index.octree().root());

        assert!(index.cull_frustum(&camera_at(100.0), &params(), 3).contains(&group));
        assert!(index.pending_queries().is_empty());
        assert_eq!(index.group(group).unwrap().occlusion(), OcclusionState::Unchecked);
    }

    #[test]
    fn test_idle_camera_throttles_front_cull() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 10.0), 2.0);
        let params = params();

        let mut camera = camera_at(100.0);
        camera.is_static = true;

        // History still remembers new objects: every frame culls
        for frame in 1..=8 {
            assert!(matches!(index.cull(&camera, &params, frame), CullOutcome::Front(_)));
        }
        assert_eq!(index.cull(&camera, &params, 8), CullOutcome::Skipped);

        for _ in 0..32 {
            index.set_cull_history(false);
        }
        let fronts = (9..=40)
            .filter(|frame| matches!(index.cull(&camera, &params, *frame), CullOutcome::Front(_)))
            .count();
        assert!(fronts >= 1 && fronts <= 5, "fronts = {}", fronts);

        // Moving again resets the back pass budget
        camera.is_static = false;
        assert!(matches!(index.cull(&camera, &params, 41), CullOutcome::Front(_)));
        assert_eq!(index.back_budget, None);
    }

    #[test]
    fn test_back_budget_zeroed_when_nothing_selected() {
        let mut arena = EntryArena::new();
        let mut index = SpatialIndex::new();
        add(&mut arena, &mut index, 1, Vec3::new(128.0, 128.0, 500.0), 1.0);
        let params = params();
        let mut camera = camera_at(100.0);
        camera.is_static = true;
        for _ in 0..32 {
            index.set_cull_history(false);
        }

        // Frame 1 with idle hash 0 takes the back pass
        assert_eq!(index.cull(&camera, &params, 1), CullOutcome::Back(Vec::new()));
        assert_eq!(index.back_budget, Some(0));
    }
}
