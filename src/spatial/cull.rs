//! Octree traversals selecting groups to load.
//!
//! The front pass walks the view frustum (without far plane) clipped by the
//! draw-distance sphere. The back pass selects groups within a sphere around
//! the camera so objects behind it stay loaded.

use crate::core::camera::CullCamera;
use crate::core::settings::CullParameters;
use crate::core::types::Vec3;
use crate::math::{Aabb, Frustum, Overlap};
use crate::spatial::occlusion::OcclusionState;
use crate::spatial::octree::{GroupId, Octree};

/// Whether objects in `extents` project large enough to be worth loading.
///
/// Anything within `near_radius` always passes; beyond it the object is
/// treated as `near_radius` meters closer than it is.
pub fn check_projection_area(
    extents: &Aabb,
    camera_origin: Vec3,
    squared_pixel_threshold: f32,
    near_radius: f32,
) -> bool {
    let distance = (extents.center() - camera_origin).length();
    if distance <= near_radius {
        return true;
    }
    let half = extents.half_extent();
    half.length_squared() / (distance - near_radius) > squared_pixel_threshold
}

/// Groups picked by one pass
#[derive(Debug, Default)]
pub struct CullResult {
    pub selected: Vec<GroupId>,
    /// Groups that started waiting on an occlusion query during this pass
    pub new_queries: Vec<GroupId>,
}

/// Frustum pass
pub(crate) struct FrontCull {
    origin: Vec3,
    frustum: Frustum,
    draw_distance: f32,
    pixel_threshold: f32,
    near_radius: f32,
    use_occlusion: bool,
    frame: u32,
}

impl FrontCull {
    pub fn new(camera: &CullCamera, params: &CullParameters, use_occlusion: bool, frame: u32) -> Self {
        Self {
            origin: camera.position,
            frustum: camera.frustum(),
            draw_distance: params.draw_distance,
            pixel_threshold: params.squared_pixel_threshold(true, camera.pixel_meter_ratio()),
            near_radius: params.effective_near_radius(),
            use_occlusion,
            frame,
        }
    }

    pub fn run(&self, tree: &mut Octree) -> CullResult {
        let mut result = CullResult::default();
        self.visit(tree, tree.root(), Overlap::Partial, &mut result);
        result
    }

    fn classify(&self, extents: &Aabb) -> Overlap {
        self.frustum
            .classify_aabb_no_far(extents)
            .min(extents.sphere_overlap(self.origin, self.draw_distance))
    }

    fn visit(&self, tree: &mut Octree, id: GroupId, parent: Overlap, result: &mut CullResult) {
        let Some(group) = tree.group(id) else {
            return;
        };
        let occlusion_checked = self.use_occlusion && !group.is_root();

        // Occluded groups wait for their next re-check frame
        if occlusion_checked && !group.needs_update(self.frame) && group.occlusion().is_occluded() {
            return;
        }

        let Some(extents) = group.extents() else {
            return;
        };
        let overlap = if parent == Overlap::Inside {
            Overlap::Inside
        } else {
            self.classify(&extents)
        };
        if overlap == Overlap::Outside {
            return;
        }

        let take = match group.object_extents() {
            None => false,
            Some(_) if overlap == Overlap::Inside => true,
            Some(objects) => {
                self.classify(&objects) != Overlap::Outside
                    && check_projection_area(&objects, self.origin, self.pixel_threshold, self.near_radius)
            }
        };
        let children: Vec<GroupId> = group.children().collect();

        if take {
            self.process(tree, id, occlusion_checked, result);
        }
        for child in children {
            self.visit(tree, child, overlap, result);
        }
    }

    fn process(&self, tree: &mut Octree, id: GroupId, occlusion_checked: bool, result: &mut CullResult) {
        let Some(group) = tree.group_mut(id) else {
            return;
        };

        if occlusion_checked
            && (group.needs_update(self.frame) || !group.is_recently_visible(self.frame))
            && group.occlusion != OcclusionState::QueryPending
        {
            // Pending groups stay selected until the answer arrives
            group.occlusion = OcclusionState::QueryPending;
            result.new_queries.push(id);
        }

        group.any_visible_frame = self.frame;
        result.selected.push(id);
    }
}

/// Back-sphere pass
pub(crate) struct BackCull {
    origin: Vec3,
    radius: f32,
    pixel_threshold: f32,
    use_occlusion: bool,
}

impl BackCull {
    pub fn new(camera: &CullCamera, params: &CullParameters, use_occlusion: bool) -> Self {
        Self {
            origin: camera.position,
            radius: params.effective_rear_radius(),
            pixel_threshold: params.squared_pixel_threshold(false, camera.pixel_meter_ratio()),
            use_occlusion,
        }
    }

    pub fn run(&self, tree: &Octree) -> Vec<GroupId> {
        let mut selected = Vec::new();
        self.visit(tree, tree.root(), &mut selected);
        selected
    }

    fn visit(&self, tree: &Octree, id: GroupId, selected: &mut Vec<GroupId>) {
        let Some(group) = tree.group(id) else {
            return;
        };
        if self.use_occlusion && !group.is_root() && !group.occlusion().is_clear() {
            return;
        }
        let Some(extents) = group.extents() else {
            return;
        };
        if extents.sphere_overlap(self.origin, self.radius) == Overlap::Outside {
            return;
        }

        if let Some(objects) = group.object_extents() {
            if objects.sphere_overlap(self.origin, self.radius) != Overlap::Outside
                && check_projection_area(&objects, self.origin, self.pixel_threshold, self.radius)
            {
                selected.push(id);
            }
        }
        for child in group.children() {
            self.visit(tree, child, selected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_area() {
        let small = Aabb::from_center_half_extent(Vec3::new(100.0, 0.0, 0.0), Vec3::splat(0.1));
        let big = Aabb::from_center_half_extent(Vec3::new(100.0, 0.0, 0.0), Vec3::splat(10.0));

        // Close objects always pass
        assert!(check_projection_area(&small, Vec3::new(95.0, 0.0, 0.0), 1.0e6, 10.0));

        // 0.03 / 90 against 300 / 90
        assert!(!check_projection_area(&small, Vec3::ZERO, 0.01, 10.0));
        assert!(check_projection_area(&big, Vec3::ZERO, 0.01, 10.0));
    }
}
