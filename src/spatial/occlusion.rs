//! Occlusion state of octree groups.
//!
//! Queries themselves are issued by the renderer; the index only records
//! which groups asked for one and the answer it got back.

/// A group seen within this many frames counts as recently visible.
pub const MIN_VIS_FRAME_RANGE: u32 = 2;

/// Groups are spread over this many frames for occlusion re-checks.
pub const LOD_PERIOD: u32 = 16;

/// Per-group occlusion state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OcclusionState {
    /// Never queried
    #[default]
    Unchecked,
    /// Waiting for a query result; treated as visible
    QueryPending,
    /// Last query found the group hidden
    Occluded,
    /// Last query found the group visible
    Visible,
}

impl OcclusionState {
    /// No occlusion information argues against the group
    pub fn is_clear(self) -> bool {
        matches!(self, OcclusionState::Unchecked | OcclusionState::Visible)
    }

    pub fn is_occluded(self) -> bool {
        self == OcclusionState::Occluded
    }
}

/// Snapshot of a group's visibility, used by entry retention checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupVisibility {
    /// Last frame any camera selected the group (0 = never)
    pub any_visible_frame: u32,
    pub occluded: bool,
}

impl GroupVisibility {
    pub fn is_recently_visible(&self, frame: u32) -> bool {
        self.any_visible_frame != 0 && frame.wrapping_sub(self.any_visible_frame) < MIN_VIS_FRAME_RANGE
    }
}

/// Whether a group with `lod_hash` re-checks its occlusion on `frame`
pub fn needs_update(lod_hash: u32, frame: u32) -> bool {
    frame % LOD_PERIOD == lod_hash
}
