use serde::{Deserialize, Serialize};

/// Output of a local detector backend for one frame.
#[derive(Clone, Debug, Default)]
pub struct DetectionResult {
    /// Bounding boxes (normalized 0..1 coordinates).
    pub detections: Vec<Detection>,
    /// Confidence of the primary detection.
    pub confidence: f32,
}

impl DetectionResult {
    /// Detections at or above `min_confidence`, optionally restricted to `classes`.
    pub fn confirmed(&self, min_confidence: f32, classes: &[ObjectClass]) -> Vec<Detection> {
        self.detections
            .iter()
            .filter(|d| d.confidence >= min_confidence)
            .filter(|d| classes.is_empty() || classes.contains(&d.class))
            .cloned()
            .collect()
    }
}

/// One detected object. Coordinates are normalized to the frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class: ObjectClass,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Package,
    Unknown,
}

impl ObjectClass {
    /// Map a free-form label from a detector or remote service.
    pub fn from_label(label: &str) -> Self {
        // "package:amazon" style sub-labels classify by their base label.
        let base = label.split(':').next().unwrap_or(label);
        match base.trim().to_lowercase().as_str() {
            "person" | "face" | "people" => ObjectClass::Person,
            "car" | "truck" | "bus" | "motorcycle" | "vehicle" => ObjectClass::Vehicle,
            "dog" | "cat" | "bird" | "animal" => ObjectClass::Animal,
            "package" | "box" | "parcel" => ObjectClass::Package,
            _ => ObjectClass::Unknown,
        }
    }
}
