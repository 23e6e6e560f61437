use super::NodeId;
use json::{array, JsonValue};
use nalgebra::Point3;

/// A point in 3D space.
/// Groups of 4 to 8 nodes describe Elements.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub coords: Point3<f64>,
}

impl Node {
    pub fn new(id: NodeId, coords: Point3<f64>) -> Self {
        Self { id, coords }
    }

    pub fn to_json(&self) -> JsonValue {
        array![self.coords.x, self.coords.y, self.coords.z]
    }
}
