//! Regions: handles and the per-region object set

pub mod handle;
pub mod objects;

pub use handle::RegionHandle;
pub use objects::{CacheProbe, RegionObjects, VisibilityPass};
