//! Mathematical utilities and data structures

pub mod aabb;
pub mod frustum;

pub use aabb::{Aabb, Overlap};
pub use frustum::{Plane, Frustum};
