use image::{GrayImage, Luma, RgbImage};

/// Grayscale with BT.601 weights (0.299 R + 0.587 G + 0.114 B), rounded.
pub fn grayscale(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

/// HSV saturation of one pixel on a 0..=255 scale.
pub fn saturation([r, g, b]: [u8; 3]) -> u8 {
    let max = r.max(g).max(b);
    if max == 0 {
        return 0;
    }
    let min = r.min(g).min(b);
    let s = f32::from(max - min) * 255.0 / f32::from(max);
    s.round() as u8
}
