pub mod color;
pub mod letterbox;

pub use color::{grayscale, saturation};
pub use letterbox::{letterbox, Letterbox};

use image::{Pixel, Primitive};
use ndarray::Array4;
use nshare::AsNdarray3;

/// Converts an RGB image into a `1×3×H×W` tensor scaled to `[0, 1]`.
pub fn to_nchw_tensor<S>(image: &image::ImageBuffer<image::Rgb<S>, Vec<S>>) -> Array4<f32>
where
    image::Rgb<S>: Pixel<Subpixel = S>,
    S: Into<f32> + Primitive + 'static,
{
    let max: f32 = S::DEFAULT_MAX_VALUE.into();
    image
        .as_ndarray3()
        .insert_axis(ndarray::Axis(0))
        .map(|v| <S as Into<f32>>::into(*v) / max)
}

/// Converts an RGB image into a `1×H×W×3` tensor scaled to `[0, 1]`.
pub fn to_nhwc_tensor(image: &image::RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    Array4::from_shape_fn(
        (1, height as usize, width as usize, 3),
        |(_, y, x, c)| f32::from(image.get_pixel(x as u32, y as u32)[c]) / 255.0,
    )
}
