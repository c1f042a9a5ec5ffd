//! 64-bit region handles: global x meters in the upper half, y in the lower.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of one region in meters
pub const REGION_WIDTH_METERS: u32 = 256;

/// Grid location of a region packed into 64 bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionHandle(pub u64);

impl RegionHandle {
    /// Handle from global meter coordinates of the region's corner
    pub fn from_parts(x: u32, y: u32) -> Self {
        Self(((x as u64) << 32) | y as u64)
    }

    /// Handle from grid coordinates (region units)
    pub fn from_grid(grid_x: u32, grid_y: u32) -> Self {
        Self::from_parts(
            grid_x.wrapping_mul(REGION_WIDTH_METERS),
            grid_y.wrapping_mul(REGION_WIDTH_METERS),
        )
    }

    pub fn x_part(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn y_part(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// Grid coordinates used in region file names
    pub fn grid_coords(&self) -> (u32, u32) {
        (self.x_part() / REGION_WIDTH_METERS, self.y_part() / REGION_WIDTH_METERS)
    }
}

impl From<u64> for RegionHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.grid_coords();
        write!(f, "({}, {})", x, y)
    }
}
