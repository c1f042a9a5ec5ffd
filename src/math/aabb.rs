//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Result of a box/volume overlap test
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Overlap {
    Outside,
    Partial,
    Inside,
}

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Create AABB from center and half-extents
    pub fn from_center_half_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self {
            min: center - half_extent,
            max: center + half_extent,
        }
    }

    /// Get center point
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Get half-extents
    pub fn half_extent(&self) -> Vec3 {
        self.size() * 0.5
    }

    /// True when every coordinate is finite (no NaN or infinity)
    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y &&
        p.z >= self.min.z && p.z <= self.max.z
    }

    /// Check if `other` lies entirely inside this AABB
    pub fn contains(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Check if two AABBs intersect
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y &&
        self.min.z <= other.max.z && self.max.z >= other.min.z
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Return the AABB moved by `offset`
    pub fn translated(&self, offset: Vec3) -> Aabb {
        Aabb {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Clamp both corners into `[-limit, limit]` on every axis
    pub fn clamped(&self, limit: f32) -> Aabb {
        let lo = Vec3::splat(-limit);
        let hi = Vec3::splat(limit);
        Aabb {
            min: self.min.clamp(lo, hi),
            max: self.max.clamp(lo, hi),
        }
    }

    /// Classify this box against a sphere.
    ///
    /// `Inside` when both corners are within the radius, `Outside` when the
    /// closest point of the box is beyond it.
    pub fn sphere_overlap(&self, origin: Vec3, radius: f32) -> Overlap {
        let r2 = radius * radius;
        if (self.min - origin).length_squared() < r2 && (self.max - origin).length_squared() < r2 {
            return Overlap::Inside;
        }

        let closest = origin.clamp(self.min, self.max);
        if (closest - origin).length_squared() > r2 {
            Overlap::Outside
        } else {
            Overlap::Partial
        }
    }

    /// Get child octant AABB for octree subdivision
    /// index: 0-7 representing xyz octant (bit 0=x, bit 1=y, bit 2=z)
    pub fn child_octant(&self, index: u8) -> Aabb {
        let center = self.center();
        let half = self.half_extent() * 0.5;

        let offset = Vec3::new(
            if index & 1 != 0 { half.x } else { -half.x },
            if index & 2 != 0 { half.y } else { -half.y },
            if index & 4 != 0 { half.z } else { -half.z },
        );

        Aabb::from_center_half_extent(center + offset, half)
    }

    /// Octant index (see [`Aabb::child_octant`]) containing `point`
    pub fn octant_of(&self, point: Vec3) -> u8 {
        let c = self.center();
        (point.x >= c.x) as u8 | ((point.y >= c.y) as u8) << 1 | ((point.z >= c.z) as u8) << 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.center(), Vec3::splat(0.5));
        assert_eq!(aabb.size(), Vec3::ONE);
    }

    #[test]
    fn test_contains() {
        let outer = Aabb::new(Vec3::ZERO, Vec3::splat(4.0));
        let inner = Aabb::new(Vec3::ONE, Vec3::splat(2.0));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn test_intersects() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        let c = Aabb::new(Vec3::splat(2.0), Vec3::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_is_finite() {
        assert!(Aabb::new(Vec3::ZERO, Vec3::ONE).is_finite());
        assert!(!Aabb::new(Vec3::splat(f32::NAN), Vec3::ONE).is_finite());
        assert!(!Aabb::new(Vec3::ZERO, Vec3::splat(f32::INFINITY)).is_finite());
    }

    #[test]
    fn test_clamped() {
        let huge = Aabb::new(Vec3::splat(-1.0e6), Vec3::splat(1.0e6));
        let c = huge.clamped(65536.0);
        assert_eq!(c.min, Vec3::splat(-65536.0));
        assert_eq!(c.max, Vec3::splat(65536.0));
    }

    #[test]
    fn test_sphere_overlap() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.sphere_overlap(Vec3::splat(0.5), 10.0), Overlap::Inside);
        assert_eq!(aabb.sphere_overlap(Vec3::new(1.5, 0.5, 0.5), 1.0), Overlap::Partial);
        assert_eq!(aabb.sphere_overlap(Vec3::splat(10.0), 1.0), Overlap::Outside);
    }

    #[test]
    fn test_child_octant() {
        let parent = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        let child0 = parent.child_octant(0); // -x, -y, -z
        assert_eq!(child0.min, Vec3::ZERO);
        assert_eq!(child0.max, Vec3::ONE);
        assert_eq!(parent.octant_of(Vec3::splat(1.5)), 7);
        assert!(parent.child_octant(7).contains_point(Vec3::splat(1.5)));
    }
}
