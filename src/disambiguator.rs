use tracing::debug;

use crate::{
    classifier::ClassificationResult,
    config::HeuristicThresholds,
    signature::MaterialSignature,
};

pub const PLASTIC: &str = "plastic";
pub const METAL: &str = "metal";

/// Post-hoc plastic/metal correction.
///
/// Rules, first match wins:
///
/// | predicted | condition                                   | corrected |
/// |-----------|---------------------------------------------|-----------|
/// | plastic   | highlight > metal_min_highlight and std_dev > metal_min_std_dev | metal |
/// | metal     | saturation > plastic_min_saturation and highlight < plastic_max_highlight | plastic |
///
/// A corrected result keeps `min(cap, confidence)`. Results that were
/// already corrected pass through, so the table is applied at most once.
#[derive(Debug, Clone, Default)]
pub struct Disambiguator {
    thresholds: HeuristicThresholds,
}

impl Disambiguator {
    pub const fn new(thresholds: HeuristicThresholds) -> Self {
        Self { thresholds }
    }

    fn corrected_label(&self, label: &str, signature: &MaterialSignature) -> Option<&'static str> {
        let t = &self.thresholds;
        match label {
            PLASTIC
                if signature.highlight_ratio > t.metal_min_highlight
                    && signature.std_dev > t.metal_min_std_dev =>
            {
                Some(METAL)
            }
            METAL
                if signature.saturation > t.plastic_min_saturation
                    && signature.highlight_ratio < t.plastic_max_highlight =>
            {
                Some(PLASTIC)
            }
            _ => None,
        }
    }

    pub fn correct(
        &self,
        result: ClassificationResult,
        signature: &MaterialSignature,
    ) -> ClassificationResult {
        if result.is_corrected() {
            return result;
        }

        match self.corrected_label(&result.label, signature) {
            Some(label) => {
                debug!(from = %result.label, to = label, ?signature, "material correction applied");
                ClassificationResult {
                    label: label.to_string(),
                    confidence: result.confidence.min(self.thresholds.corrected_confidence_cap),
                    corrected_from: Some(result.label),
                }
            }
            None => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(highlight_ratio: f64, std_dev: f64, saturation: f64) -> MaterialSignature {
        MaterialSignature {
            highlight_ratio,
            std_dev,
            edge_density: 0.1,
            saturation,
        }
    }

    #[test]
    fn test_plastic_with_metal_traits_becomes_metal() {
        let disambiguator = Disambiguator::default();
        let sig = signature(0.2, 50.0, 0.0);

        let corrected = disambiguator.correct(ClassificationResult::new("plastic", 0.95), &sig);
        assert_eq!(corrected.label, "metal");
        assert_eq!(corrected.confidence, 0.85);
        assert_eq!(corrected.corrected_from.as_deref(), Some("plastic"));

        let again = disambiguator.correct(corrected.clone(), &sig);
        assert_eq!(again, corrected);
    }

    #[test]
    fn test_metal_rule_cannot_fire_on_plastic_rule_output() {
        // even stripped of its history, the metal rule needs highlight < 0.08
        let disambiguator = Disambiguator::default();
        let sig = signature(0.2, 50.0, 200.0);

        let corrected = disambiguator.correct(ClassificationResult::new("plastic", 0.6), &sig);
        assert_eq!(corrected.label, "metal");
        assert_eq!(corrected.confidence, 0.6);

        let fresh = ClassificationResult::new(corrected.label.clone(), corrected.confidence);
        assert_eq!(disambiguator.correct(fresh.clone(), &sig), fresh);
    }

    #[test]
    fn test_metal_with_plastic_traits_becomes_plastic() {
        let disambiguator = Disambiguator::default();
        let sig = signature(0.05, 10.0, 60.0);

        let corrected = disambiguator.correct(ClassificationResult::new("metal", 0.9), &sig);
        assert_eq!(corrected.label, "plastic");
        assert!(corrected.confidence <= 0.85);

        assert_eq!(disambiguator.correct(corrected.clone(), &sig), corrected);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let disambiguator = Disambiguator::default();

        let at_edge = signature(0.15, 40.0, 0.0);
        let result = ClassificationResult::new("plastic", 0.9);
        assert_eq!(disambiguator.correct(result.clone(), &at_edge), result);

        let at_edge = signature(0.08, 0.0, 50.0);
        let result = ClassificationResult::new("metal", 0.9);
        assert_eq!(disambiguator.correct(result.clone(), &at_edge), result);
    }

    #[test]
    fn test_other_labels_pass_through() {
        let disambiguator = Disambiguator::default();
        let sig = signature(0.5, 90.0, 200.0);

        for label in ["glass", "paper", "cardboard", "trash"] {
            let result = ClassificationResult::new(label, 0.99);
            assert_eq!(disambiguator.correct(result.clone(), &sig), result);
        }
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = HeuristicThresholds {
            metal_min_highlight: 0.5,
            corrected_confidence_cap: 0.5,
            ..HeuristicThresholds::default()
        };
        let disambiguator = Disambiguator::new(thresholds);

        let result = ClassificationResult::new("plastic", 0.9);
        assert_eq!(
            disambiguator.correct(result.clone(), &signature(0.2, 50.0, 0.0)),
            result
        );
        let corrected = disambiguator.correct(result, &signature(0.6, 50.0, 0.0));
        assert_eq!(corrected.label, "metal");
        assert_eq!(corrected.confidence, 0.5);
    }
}
