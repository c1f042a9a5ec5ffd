//! Per-face GLTF material overrides cached next to the object entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::core::error::MaterialError;
use crate::region::RegionHandle;

/// Number of GLTF texture slots (base color, normal, metallic-roughness, emissive)
pub const TEXTURE_SLOTS: usize = 4;

/// Texture transform override for one slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureTransform {
    #[serde(rename = "o", skip_serializing_if = "Option::is_none")]
    pub offset: Option<[f32; 2]>,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub scale: Option<[f32; 2]>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
}

/// Decoded GLTF override. Absent fields keep the base material's value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Material {
    #[serde(rename = "tex", skip_serializing_if = "Vec::is_empty")]
    pub texture_ids: Vec<Option<Uuid>>,
    #[serde(rename = "bc", skip_serializing_if = "Option::is_none")]
    pub base_color: Option<[f32; 4]>,
    #[serde(rename = "ec", skip_serializing_if = "Option::is_none")]
    pub emissive_color: Option<[f32; 3]>,
    #[serde(rename = "mf", skip_serializing_if = "Option::is_none")]
    pub metallic_factor: Option<f32>,
    #[serde(rename = "rf", skip_serializing_if = "Option::is_none")]
    pub roughness_factor: Option<f32>,
    /// 0 = opaque, 1 = blend, 2 = mask
    #[serde(rename = "am", skip_serializing_if = "Option::is_none")]
    pub alpha_mode: Option<u8>,
    #[serde(rename = "ac", skip_serializing_if = "Option::is_none")]
    pub alpha_cutoff: Option<f32>,
    #[serde(rename = "ds", skip_serializing_if = "Option::is_none")]
    pub double_sided: Option<bool>,
    #[serde(rename = "ti", skip_serializing_if = "Vec::is_empty")]
    pub texture_transforms: Vec<TextureTransform>,
}

impl Material {
    /// Decode one face override
    pub fn decode(value: &Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected an object, got {}", value));
        }
        let material: Material = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        if material.texture_ids.len() > TEXTURE_SLOTS {
            return Err(format!("{} texture ids", material.texture_ids.len()));
        }
        if material.texture_transforms.len() > TEXTURE_SLOTS {
            return Err(format!("{} texture transforms", material.texture_transforms.len()));
        }
        if material.alpha_mode.is_some_and(|m| m > 2) {
            return Err(format!("alpha mode {:?}", material.alpha_mode));
        }
        Ok(material)
    }
}

/// Material overrides for one object, keyed by face index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialOverrideEntry {
    pub local_id: u32,
    pub region_handle: RegionHandle,
    sides: BTreeMap<u32, Value>,
    materials: BTreeMap<u32, Material>,
}

impl MaterialOverrideEntry {
    pub fn new(local_id: u32, region_handle: RegionHandle) -> Self {
        Self {
            local_id,
            region_handle,
            sides: BTreeMap::new(),
            materials: BTreeMap::new(),
        }
    }

    /// Parse the serialized form written to the extras file.
    ///
    /// Faces that do not decode are dropped; the entry itself is rejected only
    /// when identity fields are missing or the face lists are malformed.
    pub fn from_serialized(data: &Value) -> Result<Self, MaterialError> {
        let field = |name: &'static str| {
            data.get(name)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(MaterialError::MissingField(name))
        };
        let local_id = field("local_id")?;
        let region_x = field("region_handle_x")?;
        let region_y = field("region_handle_y")?;
        let mut entry = Self::new(local_id, RegionHandle::from_parts(region_x, region_y));

        let (Some(sides), Some(overrides)) = (data.get("sides"), data.get("gltf_llsd")) else {
            // No overrides for this object
            return Ok(entry);
        };
        let (Some(sides), Some(overrides)) = (sides.as_array(), overrides.as_array()) else {
            return Err(MaterialError::InvalidSides(local_id));
        };
        if sides.is_empty() || sides.len() != overrides.len() {
            return Err(MaterialError::InvalidSides(local_id));
        }

        for (side, value) in sides.iter().zip(overrides) {
            let Some(face) = side.as_u64().and_then(|f| u32::try_from(f).ok()) else {
                log::warn!("Dropping override with bad face index {} for object {}", side, local_id);
                continue;
            };
            entry.set_side(face, value.clone());
        }
        Ok(entry)
    }

    /// Inverse of [`MaterialOverrideEntry::from_serialized`]
    pub fn to_serialized(&self) -> Value {
        let mut data = json!({
            "local_id": self.local_id,
            "region_handle_x": self.region_handle.x_part(),
            "region_handle_y": self.region_handle.y_part(),
        });
        if !self.sides.is_empty() {
            data["sides"] = Value::Array(self.sides.keys().map(|f| json!(f)).collect());
            data["gltf_llsd"] = Value::Array(self.sides.values().cloned().collect());
        }
        data
    }

    /// Set the raw override of a face. Returns false (and drops the face)
    /// when the override does not decode.
    pub fn set_side(&mut self, face: u32, value: Value) -> bool {
        match Material::decode(&value) {
            Ok(material) => {
                self.sides.insert(face, value);
                self.materials.insert(face, material);
                true
            }
            Err(e) => {
                log::warn!("Dropping face {} override for object {}: {}", face, self.local_id, e);
                self.sides.remove(&face);
                self.materials.remove(&face);
                false
            }
        }
    }

    pub fn sides(&self) -> &BTreeMap<u32, Value> {
        &self.sides
    }

    pub fn materials(&self) -> &BTreeMap<u32, Material> {
        &self.materials
    }

    pub fn material(&self, face: u32) -> Option<&Material> {
        self.materials.get(&face)
    }

    pub fn face_count(&self) -> usize {
        self.sides.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        json!({
            "local_id": 42,
            "region_handle_x": 256000,
            "region_handle_y": 512000,
            "sides": [0, 3],
            "gltf_llsd": [
                {"bc": [1.0, 0.5, 0.25, 1.0], "mf": 0.2, "ds": true},
                {"tex": ["8dcd4a48-2d37-4909-9f78-f7a9eb4ef903", null], "am": 2, "ac": 0.5,
                 "ti": [{"o": [0.1, 0.2], "s": [2.0, 2.0], "r": 1.5}]}
            ]
        })
    }

    #[test]
    fn test_parse_overrides() {
        let entry = MaterialOverrideEntry::from_serialized(&sample()).unwrap();
        assert_eq!(entry.local_id, 42);
        assert_eq!(entry.region_handle, RegionHandle::from_parts(256000, 512000));
        assert_eq!(entry.face_count(), 2);

        let m0 = entry.material(0).unwrap();
        assert_eq!(m0.base_color, Some([1.0, 0.5, 0.25, 1.0]));
        assert_eq!(m0.double_sided, Some(true));

        let m3 = entry.material(3).unwrap();
        assert_eq!(m3.texture_ids.len(), 2);
        assert!(m3.texture_ids[0].is_some());
        assert!(m3.texture_ids[1].is_none());
        assert_eq!(m3.alpha_mode, Some(2));
        assert_eq!(m3.texture_transforms[0].rotation, Some(1.5));
    }

    #[test]
    fn test_missing_identity_rejected() {
        let mut data = sample();
        data.as_object_mut().unwrap().remove("region_handle_y");
        assert_eq!(
            MaterialOverrideEntry::from_serialized(&data),
            Err(MaterialError::MissingField("region_handle_y"))
        );
    }

    #[test]
    fn test_no_sides_is_valid() {
        let data = json!({"local_id": 1, "region_handle_x": 0, "region_handle_y": 0});
        let entry = MaterialOverrideEntry::from_serialized(&data).unwrap();
        assert_eq!(entry.face_count(), 0);
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let mut data = sample();
        data["sides"] = json!([0]);
        assert_eq!(MaterialOverrideEntry::from_serialized(&data), Err(MaterialError::InvalidSides(42)));

        data["sides"] = json!({"0": 1});
        assert_eq!(MaterialOverrideEntry::from_serialized(&data), Err(MaterialError::InvalidSides(42)));
    }

    #[test]
    fn test_bad_face_dropped() {
        let mut data = sample();
        data["gltf_llsd"][1] = json!({"bc": "red"});
        let entry = MaterialOverrideEntry::from_serialized(&data).unwrap();
        assert_eq!(entry.face_count(), 1);
        assert!(entry.material(3).is_none());
        assert!(entry.sides().get(&3).is_none());

        data["gltf_llsd"][0] = json!({"tex": [null, null, null, null, null]});
        let entry = MaterialOverrideEntry::from_serialized(&data).unwrap();
        assert_eq!(entry.face_count(), 0);
    }

    #[test]
    fn test_serialized_round_trip() {
        let entry = MaterialOverrideEntry::from_serialized(&sample()).unwrap();
        let again = MaterialOverrideEntry::from_serialized(&entry.to_serialized()).unwrap();
        assert_eq!(again, entry);
    }
}
