//! Cached objects of one region.
//!
//! [`RegionObjects`] owns the region's entries and their spatial index. It
//! applies object updates, feeds culling results into the creation queue,
//! unloads objects with no visibility signal left, and hands everything back
//! to the [`ObjectCache`] when the region goes away.

use std::collections::HashSet;

use uuid::Uuid;

use crate::core::camera::CullCamera;
use crate::core::settings::CullParameters;
use crate::core::time::FrameClock;
use crate::core::types::Vec3;
use crate::entry::{Activity, CacheEntry, EntryArena, EntryId, EntryMap, ExtrasMap, MaterialOverrideEntry};
use crate::region::RegionHandle;
use crate::spatial::{CreationQueue, CullOutcome, GroupId, SpatialIndex};
use crate::store::ObjectCache;

/// Outcome of checking an object's checksum against the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProbe {
    /// Cached data is current; no need to request the object
    Hit,
    /// Unknown object or stale checksum
    Miss,
}

/// Summary of one [`RegionObjects::update_visibility`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityPass {
    /// A frustum pass ran (otherwise the back-sphere pass, or nothing)
    pub front: bool,
    pub selected_groups: usize,
    /// Entries newly placed in the creation queue
    pub queued: usize,
    /// Local ids of objects unloaded this pass
    pub unloaded: Vec<u32>,
}

/// Entries, spatial index and creation queue of one region
pub struct RegionObjects {
    handle: RegionHandle,
    name: String,
    cache_id: Uuid,
    arena: EntryArena,
    extras: ExtrasMap,
    index: SpatialIndex,
    queue: CreationQueue,
    /// Entries whose bounds are known
    placed: HashSet<EntryId>,
    dirty: bool,
    has_new_objects: bool,
}

impl RegionObjects {
    pub fn new(handle: RegionHandle, name: impl Into<String>, cache_id: Uuid) -> Self {
        Self {
            handle,
            name: name.into(),
            cache_id,
            arena: EntryArena::new(),
            extras: ExtrasMap::new(),
            index: SpatialIndex::new(),
            queue: CreationQueue::new(),
            placed: HashSet::new(),
            dirty: false,
            has_new_objects: false,
        }
    }

    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_id(&self) -> Uuid {
        self.cache_id
    }

    pub fn arena(&self) -> &EntryArena {
        &self.arena
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn extras(&self) -> &ExtrasMap {
        &self.extras
    }

    pub fn entry(&self, local_id: u32) -> Option<&CacheEntry> {
        self.arena.by_local_id(local_id)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Something changed since the cache was loaded
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Ask the store for this region's cached objects
    pub fn request_cache<F>(&self, cache: &mut ObjectCache, callback: F)
    where
        F: FnOnce(RegionHandle, Option<EntryMap>, Option<ExtrasMap>) + 'static,
    {
        cache.read_from_cache(self.handle, &self.name, self.cache_id, callback);
    }

    /// Take in the maps delivered by a cache read. Objects already received
    /// from the network win over cached ones. Returns the number of entries
    /// added.
    pub fn load_cached(&mut self, entries: Option<EntryMap>, extras: Option<ExtrasMap>) -> usize {
        let Some(entries) = entries else {
            log::debug!("No cached objects for region {}", self.name);
            return 0;
        };

        let mut added = 0;
        for (local_id, entry) in entries {
            if self.arena.id_of(local_id).is_some() {
                continue;
            }
            self.arena.insert(entry);
            added += 1;
        }
        for (local_id, entry) in extras.unwrap_or_default() {
            self.extras.entry(local_id).or_insert(entry);
        }
        if added > 0 {
            self.has_new_objects = true;
        }
        log::info!("Loaded {} cached objects for region {}", added, self.name);
        added
    }

    /// Compare an announced checksum with the cached one
    pub fn probe(&mut self, local_id: u32, crc: u32) -> CacheProbe {
        match self.arena.id_of(local_id).and_then(|id| self.arena.get_mut(id)) {
            Some(entry) if entry.crc() == crc => {
                entry.record_hit();
                CacheProbe::Hit
            }
            _ => CacheProbe::Miss,
        }
    }

    /// Store a full update for an object
    pub fn apply_update(&mut self, local_id: u32, crc: u32, payload: Vec<u8>) -> EntryId {
        self.dirty = true;
        if let Some(id) = self.arena.id_of(local_id) {
            if let Some(entry) = self.arena.get_mut(id) {
                if !entry.apply_update(crc, payload) {
                    entry.record_dupe();
                }
            }
            return id;
        }

        self.has_new_objects = true;
        self.arena.insert(CacheEntry::from_update(local_id, crc, payload))
    }

    /// Position and half-size of an object, in region space
    pub fn set_bounding_info(&mut self, local_id: u32, position: Vec3, scale: Vec3) -> bool {
        let Some(id) = self.arena.id_of(local_id) else {
            return false;
        };
        self.arena.set_bounding_info(id, position, scale);
        self.placed.insert(id);
        true
    }

    /// Re-parent an object (0 = root)
    pub fn set_parent(&mut self, local_id: u32, parent_id: u32) -> bool {
        let Some(id) = self.arena.id_of(local_id) else {
            return false;
        };
        self.arena.set_parent(id, parent_id);
        self.dirty = true;
        true
    }

    pub fn set_extras(&mut self, entry: MaterialOverrideEntry) {
        self.extras.insert(entry.local_id, entry);
        self.dirty = true;
    }

    /// Mark an object stale so it is not written back
    pub fn invalidate(&mut self, local_id: u32) -> bool {
        let Some(id) = self.arena.id_of(local_id) else {
            return false;
        };
        if let Some(entry) = self.arena.get_mut(id) {
            entry.invalidate();
        }
        self.dirty = true;
        true
    }

    /// Drop an object entirely (killed on the network side)
    pub fn remove_object(&mut self, local_id: u32) -> Option<CacheEntry> {
        let id = self.arena.id_of(local_id)?;
        self.index.remove(&mut self.arena, id);
        self.placed.remove(&id);
        self.extras.remove(&local_id);
        self.dirty = true;
        self.arena.remove(id)
    }

    /// Bring the spatial index in line with bound and hierarchy changes.
    /// Only placed root entries are indexed; children live inside their
    /// parent's bounds.
    pub fn reindex(&mut self) -> usize {
        let mut indexed = 0;
        for id in self.arena.drain_changed() {
            let is_placed_root = self.placed.contains(&id) && self.arena.get(id).is_some_and(|e| e.parent_id() == 0);
            if is_placed_root {
                if self.index.update(&mut self.arena, id) {
                    indexed += 1;
                }
            } else {
                self.index.remove(&mut self.arena, id);
            }
        }
        indexed
    }

    /// Cull, queue newly visible objects and unload the ones whose
    /// visibility signal ran out.
    pub fn update_visibility(&mut self, camera: &CullCamera, params: &CullParameters, clock: &FrameClock) -> VisibilityPass {
        self.reindex();
        self.index.set_cull_history(std::mem::take(&mut self.has_new_objects));

        let frame = clock.frame();
        let outcome = self.index.cull(camera, params, frame);
        let mut pass = VisibilityPass {
            front: matches!(outcome, CullOutcome::Front(_)),
            selected_groups: outcome.groups().len(),
            ..VisibilityPass::default()
        };
        if outcome == CullOutcome::Skipped {
            return pass;
        }

        let near_radius = params.effective_near_radius();
        for group in outcome.groups() {
            let ids: Vec<EntryId> = self.index.group(*group).map(|g| g.entries().collect()).unwrap_or_default();
            for id in ids {
                let Some(entry) = self.arena.get_mut(id) else {
                    continue;
                };
                match entry.activity() {
                    Activity::Inactive => {
                        let contribution =
                            entry.compute_scene_contribution(camera.position, near_radius, params.draw_distance);
                        if contribution > 0.0 {
                            entry.set_state(Activity::Queued, frame);
                            self.queue.push(id, contribution);
                            pass.queued += 1;
                        }
                    }
                    Activity::Active => entry.mark_visible(frame),
                    Activity::Queued | Activity::Waiting => {}
                }
            }
        }

        let retention = params.retention_frames(clock.interval_secs());
        let back_radius = params.effective_rear_radius();
        let expired: Vec<EntryId> = self
            .arena
            .iter()
            .filter(|(_, e)| e.activity() == Activity::Active && e.parent_id() == 0)
            .filter(|(_, e)| {
                let group = e.group().and_then(|g| self.index.group_visibility(g));
                !e.is_any_visible(group, camera.position, back_radius, frame, retention)
            })
            .map(|(id, _)| id)
            .collect();
        for id in expired {
            pass.unloaded.extend(self.unload(id, frame));
        }

        if pass.queued > 0 || !pass.unloaded.is_empty() {
            log::debug!(
                "Region {}: {} objects queued, {} unloaded",
                self.name,
                pass.queued,
                pass.unloaded.len()
            );
        }
        pass
    }

    /// Mark up to `budget` queued objects (highest contribution first) as
    /// created. Children come along with their parent outside the budget.
    /// Returns the local ids created.
    pub fn take_creation_batch(&mut self, budget: usize, frame: u32) -> Vec<u32> {
        let mut created = Vec::new();
        let mut roots = 0;
        while roots < budget {
            let Some(queued) = self.queue.pop() else {
                break;
            };
            let Some(entry) = self.arena.get_mut(queued.id) else {
                continue;
            };
            if entry.activity() != Activity::Queued {
                continue;
            }
            entry.set_state(Activity::Active, frame);
            created.push(entry.local_id());
            roots += 1;

            let children = entry.children().to_vec();
            for child in children {
                if let Some(child) = self.arena.get_mut(child) {
                    if child.activity() != Activity::Active {
                        child.set_state(Activity::Active, frame);
                        created.push(child.local_id());
                    }
                }
            }
        }
        created
    }

    /// Groups waiting for an occlusion answer from the renderer
    pub fn pending_occlusion_queries(&mut self) -> Vec<GroupId> {
        self.index.pending_queries()
    }

    pub fn resolve_occlusion(&mut self, group: GroupId, occluded: bool) -> bool {
        self.index.resolve_query(group, occluded)
    }

    /// Hand the region's objects to the store. Consumes the region.
    pub fn save_to_cache(self, cache: &mut ObjectCache, removal_enabled: bool) -> bool {
        let Self {
            handle,
            name,
            cache_id,
            arena,
            extras,
            dirty,
            ..
        } = self;
        cache.write_to_cache(handle, &name, cache_id, arena.into_entry_map(), dirty, extras, removal_enabled)
    }

    fn unload(&mut self, id: EntryId, frame: u32) -> Vec<u32> {
        let mut unloaded = Vec::new();
        let Some(entry) = self.arena.get_mut(id) else {
            return unloaded;
        };
        entry.save_bounding_sphere();
        entry.set_state(Activity::Inactive, frame);
        unloaded.push(entry.local_id());

        let children = entry.children().to_vec();
        for child in children {
            if let Some(child) = self.arena.get_mut(child) {
                child.set_state(Activity::Inactive, frame);
                unloaded.push(child.local_id());
            }
        }
        unloaded
    }
}
