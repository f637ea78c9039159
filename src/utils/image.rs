//! Image utility functions

use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;

use crate::error::Result;

/// Encode an RGB image to PNG bytes
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Encode an RGB image as a `data:image/png;base64,...` URI
pub fn png_data_uri(image: &RgbImage) -> Result<String> {
    let png = encode_png(image)?;
    Ok(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png)
    ))
}
