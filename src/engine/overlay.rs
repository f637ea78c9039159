//! Heatmap overlay rendering

use image::{DynamicImage, RgbImage};
use ndarray::Array2;

use super::gradcam::Heatmap;
use crate::error::{BoneAgeError, Result};

pub const DEFAULT_ALPHA: f32 = 0.4;

/// Bilinear resize with half-pixel centres and edge clamping
pub fn resize_bilinear(src: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }
    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;

    let source_coord = |dst: usize, scale: f32, len: usize| -> (usize, usize, f32) {
        let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (pos.floor() as usize).min(len - 1);
        let hi = (lo + 1).min(len - 1);
        (lo, hi, pos - lo as f32)
    };

    let mut out = Array2::zeros((out_h, out_w));
    for y in 0..out_h {
        let (y0, y1, fy) = source_coord(y, scale_y, in_h);
        for x in 0..out_w {
            let (x0, x1, fx) = source_coord(x, scale_x, in_w);
            let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
            let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
            out[[y, x]] = top * (1.0 - fy) + bottom * fy;
        }
    }
    out
}

/// Jet colormap entry for an 8-bit intensity, as RGB
pub fn jet(level: u8) -> [u8; 3] {
    let v = level as f32 / 255.0;
    let channel = |centre: f32| {
        let c = (1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// 256-entry jet lookup table, blue through cyan and yellow to red
pub fn jet_lut() -> [[u8; 3]; 256] {
    let mut lut = [[0u8; 3]; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = jet(i as u8);
    }
    lut
}

/// Blend a colorized heatmap onto the original at its own resolution
pub fn overlay(original: &DynamicImage, heatmap: &Heatmap, alpha: f32) -> Result<RgbImage> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(BoneAgeError::invalid_argument(
            "alpha",
            format!("{} is outside [0, 1]", alpha),
        ));
    }

    let base = original.to_rgb8();
    let (width, height) = base.dimensions();
    let resized = resize_bilinear(heatmap.values(), height as usize, width as usize);
    let lut = jet_lut();

    let mut out = RgbImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let level = (resized[[y as usize, x as usize]].clamp(0.0, 1.0) * 255.0) as u8;
        let heat = lut[level as usize];
        let orig = base.get_pixel(x, y).0;
        for c in 0..3 {
            let blended = (1.0 - alpha) * orig[c] as f32 + alpha * heat[c] as f32;
            pixel.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}
