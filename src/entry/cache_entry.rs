//! One cached scene object: identity, checksum, opaque payload and the
//! bounding data used by the spatial index.

use std::io::{self, Read, Write};

use crate::core::error::{Error, RecordError};
use crate::core::types::{Result, Vec3};
use crate::entry::arena::EntryId;
use crate::entry::MAX_PAYLOAD_SIZE;
use crate::math::Aabb;
use crate::spatial::{GroupId, GroupVisibility};

/// Scene contribution given to objects inside the near radius.
pub const FORCE_LOAD_CONTRIBUTION: f32 = 1000.0;

/// Bin radius never exceeds this (meters).
pub const MAX_BIN_RADIUS: f32 = 256.0;

/// Parent extents are clamped to this range on every axis.
pub const EXTENT_LIMIT: f32 = 65536.0;

/// Size of the fixed record header: six little-endian u32 fields.
pub const RECORD_HEADER_SIZE: usize = 6 * 4;

/// Lifecycle state of an entry within its region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Activity {
    /// Cached only, no live object
    #[default]
    Inactive,
    /// Selected for creation, waiting in the creation queue
    Queued,
    /// Creation requested, waiting for the object to be built
    Waiting,
    /// Live object exists
    Active,
}

/// A cached object descriptor
#[derive(Clone, Debug)]
pub struct CacheEntry {
    local_id: u32,
    crc: u32,
    payload: Vec<u8>,
    activity: Activity,
    in_spatial_index: bool,
    parent_id: u32,
    pub(crate) children: Vec<EntryId>,
    pub(crate) group: Option<GroupId>,
    /// Position and extents last given by the owner of the object
    base_position: Vec3,
    base_extents: Aabb,
    /// Position group and extents, grown to include children
    position: Vec3,
    extents: Aabb,
    bin_radius: f32,
    /// Bounding sphere saved when the live object went away
    bsphere_center: Vec3,
    bsphere_radius: f32,
    scene_contribution: f32,
    hit_count: u32,
    dupe_count: u32,
    crc_change_count: u32,
    valid: bool,
    last_visible_frame: u32,
}

impl CacheEntry {
    /// Entry built from a full network update
    pub fn from_update(local_id: u32, crc: u32, payload: Vec<u8>) -> Self {
        Self {
            local_id,
            crc,
            payload,
            activity: Activity::Inactive,
            in_spatial_index: false,
            parent_id: 0,
            children: Vec::new(),
            group: None,
            base_position: Vec3::ZERO,
            base_extents: Aabb::default(),
            position: Vec3::ZERO,
            extents: Aabb::default(),
            bin_radius: 0.0,
            bsphere_center: Vec3::ZERO,
            bsphere_radius: 0.0,
            scene_contribution: 0.0,
            hit_count: 0,
            dupe_count: 0,
            crc_change_count: 0,
            valid: true,
            last_visible_frame: 0,
        }
    }

    /// Decode one record: six u32 fields followed by the payload.
    pub fn read_record<R: Read>(reader: &mut R) -> std::result::Result<Self, RecordError> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        if read_up_to(reader, &mut header) < RECORD_HEADER_SIZE {
            return Err(RecordError::TruncatedHeader);
        }

        let field = |i: usize| {
            u32::from_le_bytes([header[i * 4], header[i * 4 + 1], header[i * 4 + 2], header[i * 4 + 3]])
        };
        let size = field(5);
        if size == 0 || size > MAX_PAYLOAD_SIZE {
            return Err(RecordError::BadPayloadSize(size));
        }
        if field(0) == 0 {
            return Err(RecordError::NullLocalId);
        }

        let mut payload = vec![0u8; size as usize];
        let got = read_up_to(reader, &mut payload);
        if got < payload.len() {
            return Err(RecordError::TruncatedPayload { expected: payload.len(), got });
        }

        let mut entry = Self::from_update(field(0), field(1), payload);
        entry.hit_count = field(2);
        entry.dupe_count = field(3);
        entry.crc_change_count = field(4);
        Ok(entry)
    }

    /// Encode this entry as a record. Entries whose payload size is outside
    /// `(0, MAX_PAYLOAD_SIZE]` are refused.
    pub fn write_record<W: Write>(&self, writer: &mut W) -> Result<()> {
        if !self.has_valid_payload() {
            return Err(Error::CorruptRecord(RecordError::BadPayloadSize(
                self.payload.len().min(u32::MAX as usize) as u32,
            )));
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        let fields = [
            self.local_id,
            self.crc,
            self.hit_count,
            self.dupe_count,
            self.crc_change_count,
            self.payload.len() as u32,
        ];
        for (chunk, value) in header.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&header)?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Payload size fits the record format
    pub fn has_valid_payload(&self) -> bool {
        !self.payload.is_empty() && self.payload.len() <= MAX_PAYLOAD_SIZE as usize
    }

    /// Replace the payload with a newer update.
    ///
    /// Returns true when the checksum changed.
    pub fn apply_update(&mut self, crc: u32, payload: Vec<u8>) -> bool {
        let changed = crc != self.crc;
        if changed {
            self.crc = crc;
            self.crc_change_count = self.crc_change_count.saturating_add(1);
        }
        self.payload = payload;
        self.valid = true;
        changed
    }

    /// A cache probe hit this entry
    pub fn record_hit(&mut self) {
        self.hit_count = self.hit_count.saturating_add(1);
    }

    /// A full update arrived for data already cached
    pub fn record_dupe(&mut self) {
        self.dupe_count = self.dupe_count.saturating_add(1);
    }

    /// Mark stale; invalid entries are not written back when removal is enabled
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn set_state(&mut self, activity: Activity, frame: u32) {
        self.activity = activity;
        if activity == Activity::Active {
            self.mark_visible(frame);
        }
    }

    pub fn mark_visible(&mut self, frame: u32) {
        self.last_visible_frame = frame;
    }

    /// Set position and half-size scale from the object's owner
    pub fn set_bounding_info(&mut self, position: Vec3, scale: Vec3) {
        self.base_position = position;
        self.base_extents = Aabb::new(position - scale, position + scale);
        self.position = position;
        self.extents = self.base_extents;
        self.bin_radius = (scale.length() * 4.0).min(MAX_BIN_RADIUS);
    }

    /// Grow bounds to contain `children` (parent-relative extents).
    ///
    /// Always starts from the base extents so repeated updates do not drift.
    pub(crate) fn update_parent_bounds<I>(&mut self, child_extents: I)
    where
        I: IntoIterator<Item = Aabb>,
    {
        let mut bounds = self.base_extents;
        let mut has_children = false;
        for child in child_extents {
            bounds = bounds.merged(&child.translated(self.base_position));
            has_children = true;
        }

        if !has_children {
            self.position = self.base_position;
            self.extents = self.base_extents;
            self.bin_radius = (self.base_extents.half_extent().length() * 4.0).min(MAX_BIN_RADIUS);
            return;
        }

        let bounds = bounds.clamped(EXTENT_LIMIT);
        self.extents = bounds;
        self.position = bounds.center();
        self.bin_radius = (bounds.half_extent().length() * 4.0).min(MAX_BIN_RADIUS);
    }

    /// Remember the current bounding sphere for back-sphere retention
    pub fn save_bounding_sphere(&mut self) {
        self.bsphere_center = self.position;
        self.bsphere_radius = self.bin_radius;
    }

    /// Score used to order object creation: large nearby objects first.
    pub fn compute_scene_contribution(
        &mut self,
        camera_origin: Vec3,
        near_radius: f32,
        max_draw_distance: f32,
    ) -> f32 {
        let distance = (self.position - camera_origin).length() - near_radius;
        self.scene_contribution = if distance <= 0.0 {
            FORCE_LOAD_CONTRIBUTION
        } else {
            let rad = self.bin_radius;
            if distance + near_radius < max_draw_distance + rad {
                rad * rad / distance
            } else {
                0.0
            }
        };
        self.scene_contribution
    }

    /// Whether the entry still has a visibility signal keeping it loaded.
    ///
    /// `retention_frames` is the number of frames an entry survives without
    /// being seen.
    pub fn is_any_visible(
        &self,
        group: Option<GroupVisibility>,
        camera_origin: Vec3,
        back_sphere_radius: f32,
        frame: u32,
        retention_frames: u32,
    ) -> bool {
        let Some(group) = group else {
            return false;
        };

        let mut visible = group.is_recently_visible(frame);
        if !visible {
            let last = group.any_visible_frame.max(self.last_visible_frame);
            visible = last as u64 + retention_frames as u64 > frame as u64;
        }

        // Root objects near the camera stay loaded even when behind it
        if !visible && self.parent_id == 0 && !group.occluded {
            let (center, radius) = if self.bsphere_radius > 0.0 {
                (self.bsphere_center, self.bsphere_radius)
            } else {
                (self.position, self.bin_radius)
            };
            let threshold = back_sphere_radius + radius;
            visible = (center - camera_origin).length_squared() < threshold * threshold;
        }

        visible
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn in_spatial_index(&self) -> bool {
        self.in_spatial_index
    }

    pub(crate) fn set_in_spatial_index(&mut self, indexed: bool) {
        self.in_spatial_index = indexed;
        if !indexed {
            self.group = None;
        }
    }

    pub fn parent_id(&self) -> u32 {
        self.parent_id
    }

    pub(crate) fn set_parent_id(&mut self, parent_id: u32) {
        self.parent_id = parent_id;
    }

    pub fn children(&self) -> &[EntryId] {
        &self.children
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn base_position(&self) -> Vec3 {
        self.base_position
    }

    pub fn base_extents(&self) -> Aabb {
        self.base_extents
    }

    pub fn extents(&self) -> Aabb {
        self.extents
    }

    pub fn bin_radius(&self) -> f32 {
        self.bin_radius
    }

    pub fn bounding_sphere(&self) -> (Vec3, f32) {
        (self.bsphere_center, self.bsphere_radius)
    }

    pub fn scene_contribution(&self) -> f32 {
        self.scene_contribution
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn dupe_count(&self) -> u32 {
        self.dupe_count
    }

    pub fn crc_change_count(&self) -> u32 {
        self.crc_change_count
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn last_visible_frame(&self) -> u32 {
        self.last_visible_frame
    }

    /// Bounding data can be stored in the octree
    pub fn has_finite_bounds(&self) -> bool {
        self.extents.is_finite() && self.position.is_finite() && self.bin_radius.is_finite()
    }
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Record read stopped: {}", e);
                break;
            }
        }
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::io::Cursor;

    fn group(any_visible_frame: u32, occluded: bool) -> Option<GroupVisibility> {
        Some(GroupVisibility { any_visible_frame, occluded })
    }

    #[test]
    fn test_record_round_trip() {
        let mut entry = CacheEntry::from_update(5, 0xdead_beef, vec![1, 2, 3, 4]);
        entry.record_hit();
        entry.record_dupe();
        entry.apply_update(7, vec![9; 16]);

        let mut buf = Vec::new();
        entry.write_record(&mut buf).unwrap();
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + 16);

        let loaded = CacheEntry::read_record(&mut Cursor::new(buf)).unwrap();
        assert_eq!(loaded.local_id(), 5);
        assert_eq!(loaded.crc(), 7);
        assert_eq!(loaded.hit_count(), 1);
        assert_eq!(loaded.dupe_count(), 1);
        assert_eq!(loaded.crc_change_count(), 1);
        assert_eq!(loaded.payload(), &[9; 16][..]);
        assert_eq!(loaded.activity(), Activity::Inactive);
    }

    #[test]
    fn test_record_rejects_bad_sizes() {
        let mut buf = Vec::new();
        for v in [1u32, 2, 0, 0, 0, 0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            CacheEntry::read_record(&mut Cursor::new(&buf)).unwrap_err(),
            RecordError::BadPayloadSize(0)
        );

        buf[20..24].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());
        assert!(matches!(
            CacheEntry::read_record(&mut Cursor::new(&buf)),
            Err(RecordError::BadPayloadSize(_))
        ));

        buf[20..24].copy_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            CacheEntry::read_record(&mut Cursor::new(&buf)).unwrap_err(),
            RecordError::TruncatedPayload { expected: 8, got: 3 }
        );

        assert_eq!(
            CacheEntry::read_record(&mut Cursor::new(&buf[..10])).unwrap_err(),
            RecordError::TruncatedHeader
        );
    }

    #[test]
    fn test_record_rejects_null_local_id() {
        let mut buf = Vec::new();
        for v in [0u32, 2, 0, 0, 0, 4] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            CacheEntry::read_record(&mut Cursor::new(&buf)).unwrap_err(),
            RecordError::NullLocalId
        );
    }

    #[test]
    fn test_counters_saturate() {
        let mut buf = Vec::new();
        for v in [3u32, 1, u32::MAX, u32::MAX, u32::MAX, 2] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&[5, 6]);
        let mut entry = CacheEntry::read_record(&mut Cursor::new(&buf)).unwrap();

        entry.record_hit();
        entry.record_dupe();
        assert!(entry.apply_update(2, vec![7]));
        assert_eq!(entry.hit_count(), u32::MAX);
        assert_eq!(entry.dupe_count(), u32::MAX);
        assert_eq!(entry.crc_change_count(), u32::MAX);
    }

    #[test]
    fn test_write_refuses_empty_payload() {
        let entry = CacheEntry::from_update(1, 1, Vec::new());
        let mut buf = Vec::new();
        assert!(entry.write_record(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_change_counted_only_on_change() {
        let mut entry = CacheEntry::from_update(1, 10, vec![0]);
        assert!(!entry.apply_update(10, vec![1]));
        assert_eq!(entry.crc_change_count(), 0);
        assert!(entry.apply_update(11, vec![2]));
        assert!(entry.apply_update(12, vec![3]));
        assert_eq!(entry.crc_change_count(), 2);
        assert_eq!(entry.payload(), &[3]);
    }

    #[test]
    fn test_bounding_info() {
        let mut entry = CacheEntry::from_update(1, 0, vec![0]);
        entry.set_bounding_info(Vec3::new(10.0, 0.0, 0.0), Vec3::ONE);
        assert_eq!(entry.extents().min, Vec3::new(9.0, -1.0, -1.0));
        assert!((entry.bin_radius() - 3.0f32.sqrt() * 4.0).abs() < 1e-4);

        entry.set_bounding_info(Vec3::ZERO, Vec3::splat(1000.0));
        assert_eq!(entry.bin_radius(), MAX_BIN_RADIUS);
    }

    #[test]
    fn test_parent_bounds_clamped() {
        let mut parent = CacheEntry::from_update(1, 0, vec![0]);
        parent.set_bounding_info(Vec3::splat(60000.0), Vec3::ONE);
        let child = Aabb::new(Vec3::splat(-1.0), Vec3::splat(10000.0));
        parent.update_parent_bounds([child]);
        assert_eq!(parent.extents().max, Vec3::splat(EXTENT_LIMIT));
        assert_eq!(parent.position(), parent.extents().center());
    }

    #[test]
    fn test_scene_contribution() {
        let mut entry = CacheEntry::from_update(1, 0, vec![0]);
        entry.set_bounding_info(Vec3::new(100.0, 0.0, 0.0), Vec3::splat(0.5));

        // Inside the near radius
        assert_eq!(entry.compute_scene_contribution(Vec3::new(95.0, 0.0, 0.0), 10.0, 256.0), FORCE_LOAD_CONTRIBUTION);

        // Within draw distance: rad^2 / (distance - near)
        let c = entry.compute_scene_contribution(Vec3::ZERO, 10.0, 256.0);
        let rad = entry.bin_radius();
        assert!((c - rad * rad / 90.0).abs() < 1e-4);

        // Beyond draw distance
        assert_eq!(entry.compute_scene_contribution(Vec3::ZERO, 10.0, 50.0), 0.0);
    }

    #[test]
    fn test_closer_larger_objects_rank_first() {
        let mut rng = rand::thread_rng();
        let camera = Vec3::new(128.0, 128.0, 30.0);
        let near_radius = 8.0;
        let draw_distance = 256.0;

        for _ in 0..500 {
            let dir = Vec3::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
                .try_normalize()
                .unwrap_or(Vec3::X);
            // Past the near radius, where the score is rad^2 / distance
            let near_distance = rng.gen_range(near_radius + 1.0..200.0f32);
            let far_distance = near_distance + rng.gen_range(0.5..100.0f32);
            let b_scale = rng.gen_range(0.05..4.0f32);
            let a_scale = b_scale + rng.gen_range(0.0..4.0f32);

            let mut a = CacheEntry::from_update(1, 0, vec![0]);
            a.set_bounding_info(camera + dir * near_distance, Vec3::splat(a_scale));
            let mut b = CacheEntry::from_update(2, 0, vec![0]);
            b.set_bounding_info(camera + dir * far_distance, Vec3::splat(b_scale));
            assert!(a.bin_radius() >= b.bin_radius());

            let ca = a.compute_scene_contribution(camera, near_radius, draw_distance);
            let cb = b.compute_scene_contribution(camera, near_radius, draw_distance);
            assert!(
                ca >= cb,
                "A at {} (r {}) scored {}, B at {} (r {}) scored {}",
                near_distance,
                a.bin_radius(),
                ca,
                far_distance,
                b.bin_radius(),
                cb
            );
        }
    }

    #[test]
    fn test_is_any_visible() {
        let mut entry = CacheEntry::from_update(1, 0, vec![0]);
        entry.set_bounding_info(Vec3::new(200.0, 0.0, 0.0), Vec3::ONE);
        let far = Vec3::new(-500.0, 0.0, 0.0);

        assert!(!entry.is_any_visible(None, Vec3::ZERO, 1000.0, 10, 100));

        // Group seen last frame
        assert!(entry.is_any_visible(group(99, false), far, 0.0, 100, 0));

        // Retention window
        entry.set_state(Activity::Active, 50);
        assert!(entry.is_any_visible(group(0, false), far, 0.0, 100, 60));
        assert!(!entry.is_any_visible(group(0, false), far, 0.0, 100, 40));

        // Back sphere around the camera, root only and not occluded
        let near_cam = Vec3::new(190.0, 0.0, 0.0);
        assert!(entry.is_any_visible(group(0, false), near_cam, 5.0, 1000, 0));
        assert!(!entry.is_any_visible(group(0, true), near_cam, 5.0, 1000, 0));
        entry.set_parent_id(9);
        assert!(!entry.is_any_visible(group(0, false), near_cam, 5.0, 1000, 0));
    }

    #[test]
    fn test_saved_sphere_used_for_back_check() {
        let mut entry = CacheEntry::from_update(1, 0, vec![0]);
        entry.set_bounding_info(Vec3::ZERO, Vec3::splat(0.1));
        entry.save_bounding_sphere();
        entry.set_bounding_info(Vec3::splat(5000.0), Vec3::splat(0.1));

        assert_eq!(entry.bounding_sphere().0, Vec3::ZERO);
        assert!(entry.is_any_visible(group(0, false), Vec3::new(1.0, 0.0, 0.0), 2.0, 1000, 0));
    }
}
