//! Cache configuration and the culling/retention parameters derived from it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Frame rate the retention time is expressed against.
pub const TARGET_FPS: u32 = 30;

/// Maximum number of regions the header can describe.
pub const MAX_REGION_SLOTS: u32 = 128;

/// Objects within this distance (meters) of the camera are always loaded.
const FORCE_LOAD_MIN_RADIUS: f32 = 1.0;

/// User-facing configuration of the object cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of resident regions on disk
    pub capacity: u32,
    /// Master switch for the disk cache
    pub disk_cache_enabled: bool,
    /// Allow reading region files
    pub allow_reads: bool,
    /// Allow writing region files
    pub allow_writes: bool,
    /// Perform reads on the background worker
    pub threaded_reads: bool,
    /// Perform writes on the background worker
    pub threaded_writes: bool,
    /// Seconds a non-visible object stays in memory (0 = forever)
    pub non_visible_retention_secs: u32,
    /// Objects within this radius stay loaded regardless of visibility
    pub scene_load_min_radius: f32,
    /// Minimum projected size for in-frustum objects to be loaded
    pub front_pixel_threshold: f32,
    /// Minimum projected size for out-of-frustum objects to stay loaded
    pub rear_pixel_threshold: f32,
    /// Percentage of draw distance past which rear objects are dropped
    pub rear_max_radius_fraction: f32,
    /// Shrink retention when the texture system reports memory pressure
    pub biased_retention: bool,
    /// Use occlusion results to skip octree groups
    pub use_occlusion: bool,
    /// Prefix for cache file names (grid label, e.g. "beta_")
    pub grid_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: MAX_REGION_SLOTS,
            disk_cache_enabled: true,
            allow_reads: true,
            allow_writes: true,
            threaded_reads: true,
            threaded_writes: true,
            non_visible_retention_secs: 10,
            scene_load_min_radius: 32.0,
            front_pixel_threshold: 100.0,
            rear_pixel_threshold: 400.0,
            rear_max_radius_fraction: 75.0,
            biased_retention: false,
            use_occlusion: true,
            grid_prefix: String::new(),
        }
    }
}

impl CacheSettings {
    /// Settings for a store that never touches background threads.
    pub fn synchronous() -> Self {
        Self {
            threaded_reads: false,
            threaded_writes: false,
            ..Self::default()
        }
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Settings(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| Error::Settings(e.to_string()))
    }

    /// Capacity clamped to what the header can hold.
    pub fn effective_capacity(&self) -> u32 {
        self.capacity.clamp(1, MAX_REGION_SLOTS)
    }
}

/// Culling and retention parameters derived from [`CacheSettings`] and the
/// current draw distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CullParameters {
    /// Frames a non-visible object is kept (u32::MAX = forever)
    pub min_frame_range: u32,
    /// Radius around the camera where everything is loaded
    pub near_radius: f32,
    /// Radius of the back sphere used for rear retention
    pub rear_far_radius: f32,
    pub front_pixel_threshold: f32,
    /// Never below `front_pixel_threshold`
    pub rear_pixel_threshold: f32,
    pub draw_distance: f32,
    pub biased_retention: bool,
    pub use_occlusion: bool,
    /// Texture discard bias reported by the renderer (0 = no pressure)
    pub discard_bias: f32,
}

impl CullParameters {
    pub fn derive(settings: &CacheSettings, draw_distance: f32) -> Self {
        let min_frame_range = if settings.non_visible_retention_secs == 0 {
            u32::MAX
        } else {
            settings
                .non_visible_retention_secs
                .saturating_mul(TARGET_FPS)
                - 1
        };

        let near_radius = settings
            .scene_load_min_radius
            .min(draw_distance)
            .max(FORCE_LOAD_MIN_RADIUS);

        let rear_far_radius = (settings.rear_max_radius_fraction * draw_distance / 100.0)
            .max(FORCE_LOAD_MIN_RADIUS)
            .max(settings.scene_load_min_radius)
            .min(draw_distance);

        let params = Self {
            min_frame_range,
            near_radius,
            rear_far_radius,
            front_pixel_threshold: settings.front_pixel_threshold,
            rear_pixel_threshold: settings
                .rear_pixel_threshold
                .max(settings.front_pixel_threshold),
            draw_distance,
            biased_retention: settings.biased_retention,
            use_occlusion: settings.use_occlusion,
            discard_bias: 0.0,
        };
        log::debug!(
            "Cull parameters: frame range {} - near radius {}m - rear far radius {}m",
            params.min_frame_range,
            params.near_radius,
            params.rear_far_radius
        );
        params
    }

    /// Squared projected-size threshold in world units for the given
    /// `pixel_meter_ratio` (screen pixels per meter at unit distance).
    pub fn squared_pixel_threshold(&self, is_front: bool, pixel_meter_ratio: f32) -> f32 {
        let threshold = if is_front {
            self.front_pixel_threshold
        } else {
            self.rear_pixel_threshold
        };
        let projection = if pixel_meter_ratio > 0.0 {
            threshold / pixel_meter_ratio
        } else {
            0.0
        };
        projection * projection
    }

    /// Same parameters with a new discard bias
    pub fn with_discard_bias(self, discard_bias: f32) -> Self {
        Self { discard_bias: discard_bias.max(0.0), ..self }
    }

    fn bias_divisor(&self) -> f32 {
        if self.biased_retention {
            self.discard_bias / 3.0 + 1.0
        } else {
            1.0
        }
    }

    /// Near radius, shrunk under memory pressure when biasing is enabled.
    pub fn effective_near_radius(&self) -> f32 {
        self.near_radius / self.bias_divisor()
    }

    /// Back sphere radius, shrunk under memory pressure when biasing is enabled.
    pub fn effective_rear_radius(&self) -> f32 {
        self.rear_far_radius / self.bias_divisor()
    }

    /// Number of frames an invisible object survives, normalized to the
    /// actual frame interval.
    pub fn retention_frames(&self, frame_interval_secs: f32) -> u32 {
        let fps_ratio = if frame_interval_secs > 0.0 {
            1.0 / TARGET_FPS as f32 / frame_interval_secs
        } else {
            f32::MAX
        };
        let mut delta = self.min_frame_range as f32 * fps_ratio;
        if self.biased_retention {
            delta /= self.discard_bias + 1.0;
        }
        // Float to int casts saturate.
        delta as u32
    }

    /// Budget of consecutive back-sphere passes while the camera is idle.
    pub fn back_selection_budget(&self) -> u32 {
        self.min_frame_range.saturating_sub(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let s = CacheSettings::default();
        assert_eq!(s.capacity, 128);
        assert!(s.disk_cache_enabled);
        assert!(s.rear_pixel_threshold >= s.front_pixel_threshold);
    }

    #[test]
    fn test_settings_persistence() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("settings.json");

        let mut settings = CacheSettings::default();
        settings.capacity = 42;
        settings.grid_prefix = "beta_".to_string();
        settings.save_sync(&path).expect("save failed");

        let loaded = CacheSettings::load_sync(&path).expect("load failed");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings: CacheSettings = serde_json::from_str(r#"{"capacity": 3}"#).unwrap();
        assert_eq!(settings.capacity, 3);
        assert!(settings.threaded_reads);
    }

    #[test]
    fn test_capacity_clamped() {
        let mut s = CacheSettings::default();
        s.capacity = 1000;
        assert_eq!(s.effective_capacity(), MAX_REGION_SLOTS);
        s.capacity = 0;
        assert_eq!(s.effective_capacity(), 1);
    }

    #[test]
    fn test_rear_threshold_never_below_front() {
        let mut s = CacheSettings::default();
        s.front_pixel_threshold = 500.0;
        s.rear_pixel_threshold = 10.0;
        let p = CullParameters::derive(&s, 256.0);
        assert_eq!(p.rear_pixel_threshold, 500.0);
        assert!(p.squared_pixel_threshold(false, 2.0) >= p.squared_pixel_threshold(true, 2.0));
    }

    #[test]
    fn test_radii_bounded_by_draw_distance() {
        let s = CacheSettings::default();
        let p = CullParameters::derive(&s, 16.0);
        assert_eq!(p.near_radius, 16.0);
        assert_eq!(p.rear_far_radius, 16.0);

        let p = CullParameters::derive(&s, 512.0);
        assert_eq!(p.near_radius, 32.0);
        assert_eq!(p.rear_far_radius, 384.0);
    }

    #[test]
    fn test_zero_retention_means_forever() {
        let mut s = CacheSettings::default();
        s.non_visible_retention_secs = 0;
        let p = CullParameters::derive(&s, 128.0);
        assert_eq!(p.min_frame_range, u32::MAX);
    }

    #[test]
    fn test_retention_frames_scaled() {
        let mut s = CacheSettings::default();
        s.non_visible_retention_secs = 2;
        let p = CullParameters::derive(&s, 128.0);
        assert_eq!(p.min_frame_range, 59);

        // Twice the target frame rate needs twice the frames for the same time.
        let at_60 = p.retention_frames(1.0 / 60.0);
        assert!((117..=118).contains(&at_60));

        s.biased_retention = true;
        let biased = CullParameters::derive(&s, 128.0).with_discard_bias(1.0);
        assert!(biased.retention_frames(1.0 / 30.0) < p.retention_frames(1.0 / 30.0));
        assert!(biased.with_discard_bias(3.0).effective_near_radius() < biased.near_radius);

        // Bias is ignored unless biased retention is enabled
        assert_eq!(p.with_discard_bias(3.0).effective_near_radius(), p.near_radius);
    }
}
