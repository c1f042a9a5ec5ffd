//! Core types and utilities

pub mod types;
pub mod arena;
pub mod error;
pub mod logging;
pub mod time;
pub mod camera;
pub mod settings;

pub use types::*;
pub use arena::{Arena, Id};
pub use error::{Error, MaterialError, RecordError};
pub use camera::CullCamera;
pub use settings::{CacheSettings, CullParameters};
pub use time::FrameClock;
