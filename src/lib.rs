//! Vocache - disk-persisted per-region object cache with octree visibility culling

pub mod core;
pub mod math;
pub mod entry;
pub mod spatial;
pub mod region;
pub mod store;
