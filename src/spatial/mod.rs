//! Spatial index over cached entries: octree groups, frustum and
//! back-sphere culling, occlusion bookkeeping and the creation queue.

pub mod octree;
pub mod occlusion;
pub mod cull;
pub mod partition;
pub mod priority;

pub use octree::{Group, GroupId, Octree};
pub use occlusion::{GroupVisibility, OcclusionState};
pub use cull::check_projection_area;
pub use partition::{CullOutcome, SpatialIndex};
pub use priority::{CreationQueue, QueuedEntry};
