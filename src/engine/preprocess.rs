//! Image preprocessing for the bone age models
//!
//! Every X-ray is reduced to a single channel, resized to 224x224 and
//! standardized with mean 0.5 / std 0.5, giving values in [-1, 1].

use std::io::Cursor;

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use ndarray::{Array2, Array4};
use rand::Rng;

use crate::error::{BoneAgeError, Result};

/// Model input side length
pub const INPUT_SIZE: u32 = 224;

/// Per-channel standardization constants
pub const NORMALIZE_MEAN: f32 = 0.5;
pub const NORMALIZE_STD: f32 = 0.5;

/// Maximum rotation applied by [`augment`], in degrees
pub const AUGMENT_MAX_ROTATION_DEG: f32 = 10.0;
/// Maximum translation as a fraction of the image side
pub const AUGMENT_MAX_TRANSLATE: f32 = 0.05;
/// Scale jitter range
pub const AUGMENT_SCALE_RANGE: (f32, f32) = (0.95, 1.05);
/// Brightness and contrast factors are drawn from [1 - j, 1 + j]
pub const AUGMENT_COLOR_JITTER: f32 = 0.2;

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(BoneAgeError::InvalidImage("image has zero area".to_string()));
    }
    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation so scanner or phone captures are upright
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // See https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Convert any image to a single-channel grid
pub fn to_grayscale(image: &DynamicImage) -> Result<GrayImage> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(BoneAgeError::InvalidImage("image has zero area".to_string()));
    }
    Ok(image.to_luma8())
}

/// Deterministic preprocessing used on the inference path.
///
/// Output shape is `(1, 1, 224, 224)`; identical pixels always give an
/// identical tensor.
pub fn normalize(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let resized = resize_to_input(&to_grayscale(image)?);
    let intensities = gray_to_unit(&resized);
    unit_to_tensor(&intensities, device)
}

/// Stochastic variant for training-style resampling.
///
/// With probability 0.5 applies rotation, translation/scale jitter and
/// brightness/contrast jitter; otherwise identical to [`normalize`].
pub fn augment<R: Rng + ?Sized>(image: &DynamicImage, device: &Device, rng: &mut R) -> Result<Tensor> {
    if !rng.gen_bool(0.5) {
        return normalize(image, device);
    }

    let resized = resize_to_input(&to_grayscale(image)?);
    let size = INPUT_SIZE as f32;

    let angle = rng
        .gen_range(-AUGMENT_MAX_ROTATION_DEG..=AUGMENT_MAX_ROTATION_DEG)
        .to_radians();
    let max_shift = AUGMENT_MAX_TRANSLATE * size;
    let tx = rng.gen_range(-max_shift..=max_shift).round();
    let ty = rng.gen_range(-max_shift..=max_shift).round();
    let scale = rng.gen_range(AUGMENT_SCALE_RANGE.0..=AUGMENT_SCALE_RANGE.1);

    let mut warped = warp_similarity(&resized, angle, scale, (tx, ty));

    let brightness = rng.gen_range(1.0 - AUGMENT_COLOR_JITTER..=1.0 + AUGMENT_COLOR_JITTER);
    let contrast = rng.gen_range(1.0 - AUGMENT_COLOR_JITTER..=1.0 + AUGMENT_COLOR_JITTER);
    jitter_brightness_contrast(&mut warped, brightness, contrast);

    unit_to_tensor(&warped, device)
}

fn resize_to_input(gray: &GrayImage) -> GrayImage {
    image::imageops::resize(gray, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
}

/// Scale 8-bit intensities to [0, 1]
fn gray_to_unit(gray: &GrayImage) -> Array2<f32> {
    let (width, height) = gray.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        gray.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    })
}

/// Standardize [0, 1] intensities and add batch and channel axes
fn unit_to_tensor(pixels: &Array2<f32>, device: &Device) -> Result<Tensor> {
    let (height, width) = pixels.dim();
    let mut tensor = Array4::<f32>::zeros((1, 1, height, width));
    for ((y, x), v) in pixels.indexed_iter() {
        tensor[[0, 0, y, x]] = (v - NORMALIZE_MEAN) / NORMALIZE_STD;
    }
    let data = tensor.into_raw_vec();
    Ok(Tensor::from_vec(data, (1, 1, height, width), device)?)
}

/// Rotate, scale and translate around the image centre with bilinear
/// sampling. Pixels mapped from outside the source are black.
fn warp_similarity(gray: &GrayImage, angle: f32, scale: f32, shift: (f32, f32)) -> Array2<f32> {
    let (width, height) = gray.dimensions();
    let (cx, cy) = ((width as f32 - 1.0) / 2.0, (height as f32 - 1.0) / 2.0);
    let (sin, cos) = angle.sin_cos();

    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        // Inverse mapping: undo translation, scale, then rotation
        let dx = (x as f32 - cx - shift.0) / scale;
        let dy = (y as f32 - cy - shift.1) / scale;
        let src_x = cos * dx + sin * dy + cx;
        let src_y = -sin * dx + cos * dy + cy;
        sample_bilinear(gray, src_x, src_y) / 255.0
    })
}

fn sample_bilinear(gray: &GrayImage, src_x: f32, src_y: f32) -> f32 {
    let (w, h) = gray.dimensions();
    if src_x < 0.0 || src_y < 0.0 || src_x > (w - 1) as f32 || src_y > (h - 1) as f32 {
        return 0.0;
    }

    let x0 = src_x.floor() as u32;
    let y0 = src_y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = src_x - x0 as f32;
    let fy = src_y - y0 as f32;

    let v00 = gray.get_pixel(x0, y0)[0] as f32;
    let v10 = gray.get_pixel(x1, y0)[0] as f32;
    let v01 = gray.get_pixel(x0, y1)[0] as f32;
    let v11 = gray.get_pixel(x1, y1)[0] as f32;

    v00 * (1.0 - fx) * (1.0 - fy) + v10 * fx * (1.0 - fy) + v01 * (1.0 - fx) * fy + v11 * fx * fy
}

/// Brightness scales intensities; contrast blends towards the mean
fn jitter_brightness_contrast(pixels: &mut Array2<f32>, brightness: f32, contrast: f32) {
    pixels.mapv_inplace(|v| (v * brightness).clamp(0.0, 1.0));
    let mean = pixels.mean().unwrap_or(0.0);
    pixels.mapv_inplace(|v| (contrast * v + (1.0 - contrast) * mean).clamp(0.0, 1.0));
}
