//! Cached object descriptors and their per-face material overrides

pub mod cache_entry;
pub mod arena;
pub mod material;

pub use cache_entry::{Activity, CacheEntry};
pub use arena::{EntryArena, EntryId};
pub use material::{Material, MaterialOverrideEntry, TextureTransform};

use std::collections::BTreeMap;

/// Largest payload accepted for a single cached object, in bytes.
pub const MAX_PAYLOAD_SIZE: u32 = 10_000;

/// Entries of one region keyed by local id
pub type EntryMap = BTreeMap<u32, CacheEntry>;

/// Material overrides of one region keyed by local id
pub type ExtrasMap = BTreeMap<u32, MaterialOverrideEntry>;
