use std::path::Path;

use image::{DynamicImage, RgbImage};
use imageproc::edges::canny;
use serde::Serialize;

use crate::{
    config::HeuristicThresholds,
    errors::{Result, WasteSortError},
    imageops::{grayscale, saturation},
};

/// Low-level visual statistics of one crop.
///
/// Proxies for reflectivity (`highlight_ratio`), contrast (`std_dev`),
/// sharpness (`edge_density`) and colourfulness (`saturation`). Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaterialSignature {
    /// Fraction of pixels brighter than the highlight threshold, in `[0, 1]`
    pub highlight_ratio: f64,
    /// Grayscale standard deviation
    pub std_dev: f64,
    /// Fraction of pixels on a Canny edge, in `[0, 1]`
    pub edge_density: f64,
    /// Mean HSV saturation, in `[0, 255]`
    pub saturation: f64,
}

#[derive(Debug, Clone)]
pub struct MaterialSignatureExtractor {
    brightness_threshold: u8,
    canny_low: f32,
    canny_high: f32,
}

impl Default for MaterialSignatureExtractor {
    fn default() -> Self {
        Self::new(&HeuristicThresholds::default())
    }
}

impl MaterialSignatureExtractor {
    pub fn new(thresholds: &HeuristicThresholds) -> Self {
        Self {
            brightness_threshold: thresholds.brightness_threshold,
            canny_low: thresholds.canny_low,
            canny_high: thresholds.canny_high,
        }
    }

    pub fn signature_of_file(&self, path: &Path) -> Result<MaterialSignature> {
        let image = image::open(path).map_err(|e| WasteSortError::decode(path, e))?;
        Ok(self.signature(&image))
    }

    pub fn signature(&self, image: &DynamicImage) -> MaterialSignature {
        self.signature_rgb(&image.to_rgb8())
    }

    pub fn signature_rgb(&self, image: &RgbImage) -> MaterialSignature {
        let pixel_count = u64::from(image.width()) * u64::from(image.height());
        if pixel_count == 0 {
            return MaterialSignature {
                highlight_ratio: 0.0,
                std_dev: 0.0,
                edge_density: 0.0,
                saturation: 0.0,
            };
        }
        let total = pixel_count as f64;

        let gray = grayscale(image);

        let mut highlights = 0u64;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for value in gray.pixels().map(|p| p[0]) {
            if value > self.brightness_threshold {
                highlights += 1;
            }
            let v = f64::from(value);
            sum += v;
            sum_sq += v * v;
        }
        let mean = sum / total;
        let variance = (sum_sq / total - mean * mean).max(0.0);

        let edges = canny(&gray, self.canny_low, self.canny_high);
        let edge_pixels = edges.pixels().filter(|p| p[0] > 0).count();

        let saturation_sum: u64 = image
            .pixels()
            .map(|p| u64::from(saturation(p.0)))
            .sum();

        MaterialSignature {
            highlight_ratio: highlights as f64 / total,
            std_dev: variance.sqrt(),
            edge_density: edge_pixels as f64 / total,
            saturation: saturation_sum as f64 / total,
        }
    }
}
