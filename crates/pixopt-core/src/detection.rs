//! Detection results and the owned sequences returned to callers.

/// Anything that carries a confidence score.
pub trait Scored {
    fn confidence(&self) -> f32;
}

/// Bounding box in pixel coordinates of the analysed raster.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedObject {
    pub class_name: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Single-channel mask (0 or 255 per pixel) at raster resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentationMask {
    pub mask: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub class_name: String,
    pub confidence: f32,
}

impl SegmentationMask {
    /// Fraction of pixels set in the mask.
    pub fn coverage(&self) -> f32 {
        if self.mask.is_empty() {
            return 0.0;
        }
        let set = self.mask.iter().filter(|&&m| m != 0).count();
        set as f32 / self.mask.len() as f32
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Landmark points (eyes, nose, mouth corners) in pixel coordinates.
    pub landmarks: Vec<(f32, f32)>,
    pub confidence: f32,
    pub attributes: Option<String>,
}

impl Scored for DetectedObject {
    fn confidence(&self) -> f32 {
        self.confidence
    }
}

impl Scored for SegmentationMask {
    fn confidence(&self) -> f32 {
        self.confidence
    }
}

impl Scored for DetectedFace {
    fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Owned, caller-held sequence of detections. Dropping it releases
/// every element.
#[derive(Clone, Debug, PartialEq)]
pub struct Detections<T> {
    items: Vec<T>,
}

impl<T: Scored> Detections<T> {
    /// Keep proposals whose confidence is at least `threshold` (inclusive).
    pub fn filtered(items: Vec<T>, threshold: f32) -> Self {
        let items = items
            .into_iter()
            .filter(|d| d.confidence() >= threshold)
            .collect();
        Self { items }
    }
}

impl<T> Detections<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for Detections<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> IntoIterator for Detections<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Detections<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(confidence: f32) -> DetectedObject {
        DetectedObject {
            class_name: "blob".into(),
            confidence,
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let found = Detections::filtered(vec![object(0.2), object(0.5), object(0.9)], 0.5);
        let scores: Vec<f32> = found.iter().map(|o| o.confidence).collect();
        assert_eq!(scores, vec![0.5, 0.9]);
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let found = Detections::filtered(vec![object(0.1)], 0.95);
        assert!(found.is_empty());
        assert_eq!(found.len(), 0);
    }

    #[test]
    fn mask_coverage_counts_set_pixels() {
        let mask = SegmentationMask {
            mask: vec![0, 255, 255, 0],
            width: 2,
            height: 2,
            class_name: "foreground".into(),
            confidence: 0.8,
        };
        assert!((mask.coverage() - 0.5).abs() < f32::EPSILON);
    }
}
