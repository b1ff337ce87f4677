//! Image encoding: `DynamicImage` → base64 PNG wrapped in [`ImageData`].
//!
//! Vision APIs accept images as base64 payloads embedded in the JSON
//! request body. PNG is chosen over JPEG because it is lossless — text
//! crispness matters far more than file size when the oracle has to read
//! small size/quantity digits in a table.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

use crate::model::ImageData;

/// Encode a rendered page as a base64 PNG ready for the oracle.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        assert!(!data.data.is_empty());
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert!(!decoded.is_empty());
    }
}
