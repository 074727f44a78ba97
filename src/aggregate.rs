use indexmap::IndexMap;
use serde::Serialize;

use crate::{classifier::ClassificationResult, detector::BoundingBox};

/// One classified object in the response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectResult {
    pub bbox: BoundingBox,
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    pub crop_url: String,
}

impl ObjectResult {
    pub fn new(bbox: BoundingBox, result: ClassificationResult, crop_url: String) -> Self {
        Self {
            bbox,
            label: result.label,
            confidence: result.confidence,
            crop_url,
        }
    }
}

/// Response payload of one classification request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub objects: Vec<ObjectResult>,
    /// Label → share of objects in percent, one decimal, first-seen order
    pub percentages: IndexMap<String, f64>,
    pub image_url: String,
}

impl AggregatedResult {
    pub fn first(&self) -> Option<&ObjectResult> {
        self.objects.first()
    }
}

/// Ties go to the even tenth: 6.25 → 6.2, 93.75 → 93.8.
fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round_ties_even() / 10.0
}

/// Percentage of objects per label. Labels with no objects never appear.
pub fn percentages(objects: &[ObjectResult]) -> IndexMap<String, f64> {
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for object in objects {
        *counts.entry(object.label.as_str()).or_default() += 1;
    }

    let total = objects.len() as f64;
    counts
        .into_iter()
        .map(|(label, count)| {
            (
                label.to_string(),
                round_one_decimal(count as f64 / total * 100.0),
            )
        })
        .collect()
}

/// Composes per-object results, kept in detection order, into the response.
pub fn aggregate(objects: Vec<ObjectResult>, image_url: String) -> AggregatedResult {
    AggregatedResult {
        percentages: percentages(&objects),
        objects,
        image_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(label: &str) -> ObjectResult {
        ObjectResult::new(
            BoundingBox::full_frame(10, 10),
            ClassificationResult::new(label, 0.5),
            "/uploads/x.jpg".to_string(),
        )
    }

    #[test]
    fn test_even_split() {
        let result = aggregate(vec![object("plastic"), object("metal")], "/uploads/a.jpg".into());
        assert_eq!(result.percentages.get("plastic"), Some(&50.0));
        assert_eq!(result.percentages.get("metal"), Some(&50.0));
        assert_eq!(result.objects.len(), 2);
        assert_eq!(result.objects[0].label, "plastic");
    }

    #[test]
    fn test_thirds_round_within_tolerance() {
        let objects = vec![object("glass"), object("paper"), object("trash")];
        let shares = percentages(&objects);

        assert_eq!(shares.values().copied().collect::<Vec<_>>(), vec![33.3, 33.3, 33.3]);
        let sum: f64 = shares.values().sum();
        assert!((sum - 100.0).abs() <= 0.1 + 1e-9);
    }

    #[test]
    fn test_sixteenths_round_half_to_even() {
        let mut objects = vec![object("a")];
        objects.extend((0..15).map(|_| object("b")));
        let shares = percentages(&objects);

        assert_eq!(shares["a"], 6.2);
        assert_eq!(shares["b"], 93.8);
        let sum: f64 = shares.values().sum();
        assert!((sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_seen_order_and_no_empty_labels() {
        let objects = vec![object("metal"), object("glass"), object("metal"), object("metal")];
        let shares = percentages(&objects);

        assert_eq!(shares.keys().collect::<Vec<_>>(), vec!["metal", "glass"]);
        assert_eq!(shares["metal"], 75.0);
        assert_eq!(shares["glass"], 25.0);
    }

    #[test]
    fn test_json_shape() {
        let result = aggregate(vec![object("paper")], "/uploads/a.jpg".into());
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "objects": [{
                    "bbox": [0, 0, 10, 10],
                    "class": "paper",
                    "confidence": 0.5,
                    "crop_url": "/uploads/x.jpg"
                }],
                "percentages": {"paper": 100.0},
                "image_url": "/uploads/a.jpg"
            })
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(percentages(&[]).is_empty());
    }
}
