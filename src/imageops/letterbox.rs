use image::{imageops, imageops::FilterType, GenericImageView, ImageBuffer, Pixel, Rgb, RgbImage};

/// Placement of a resized image inside a square canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Maps a point from canvas coordinates back to the source image.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

fn centered(width: u32, height: u32, pad_width: u32, pad_height: u32) -> Option<(u32, u32)> {
    if width > pad_width || height > pad_height {
        return None;
    }
    Some(((pad_width - width) / 2, (pad_height - height) / 2))
}

fn pad_center<I, P>(image: &I, size: u32, color: P) -> Option<(ImageBuffer<P, Vec<P::Subpixel>>, (u32, u32))>
where
    I: GenericImageView<Pixel = P>,
    P: Pixel,
{
    let (width, height) = image.dimensions();
    centered(width, height, size, size).map(|(x, y)| {
        let mut canvas = ImageBuffer::from_pixel(size, size, color);
        imageops::overlay(&mut canvas, image, i64::from(x), i64::from(y));
        (canvas, (x, y))
    })
}

/// Scales `image` to fit a `size`×`size` canvas without distortion and pads
/// the remainder with `fill`.
pub fn letterbox(image: &RgbImage, size: u32, fill: u8) -> (RgbImage, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, new_width, new_height, FilterType::Triangle);
    let fill = Rgb([fill, fill, fill]);
    // resized always fits, both sides are clamped to `size`
    let (canvas, (pad_x, pad_y)) = pad_center(&resized, size, fill)
        .unwrap_or_else(|| (ImageBuffer::from_pixel(size, size, fill), (0, 0)));

    (
        canvas,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_rejects_oversized() {
        assert_eq!(centered(10, 10, 5, 20), None);
        assert_eq!(centered(4, 10, 10, 10), Some((3, 0)));
    }

    #[test]
    fn test_letterbox_wide_image() {
        let image = RgbImage::from_pixel(400, 200, Rgb([10, 20, 30]));
        let (canvas, placement) = letterbox(&image, 640, 114);

        assert_eq!(canvas.dimensions(), (640, 640));
        assert!((placement.scale - 1.6).abs() < 1e-6);
        assert_eq!(placement.pad_x, 0);
        assert_eq!(placement.pad_y, 160);
        assert_eq!(canvas.get_pixel(320, 10), &Rgb([114, 114, 114]));
        assert_eq!(canvas.get_pixel(320, 320), &Rgb([10, 20, 30]));

        let (x, y) = placement.to_source(640.0, 480.0);
        assert!((x - 400.0).abs() < 1e-3);
        assert!((y - 200.0).abs() < 1e-3);
    }
}
