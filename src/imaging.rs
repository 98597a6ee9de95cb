//! Normalizes an uploaded original into the PNG the image edit API accepts.

use std::io::Cursor;

use image::{imageops::FilterType, GenericImageView, ImageFormat, ImageReader};
use thiserror::Error;

/// Longest side the edit endpoint is sent.
pub const MAX_API_DIMENSION: u32 = 2048;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("unsupported image format {0:?}")]
    Unsupported(ImageFormat),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

/// PNGs already within [`MAX_API_DIMENSION`] pass through untouched; JPEGs
/// and oversized PNGs are decoded, scaled down keeping aspect ratio, and
/// re-encoded as PNG.
pub fn to_api_png(bytes: &[u8]) -> Result<Vec<u8>, ImagingError> {
    let format = image::guess_format(bytes)?;
    match format {
        ImageFormat::Png => {
            let (width, height) =
                ImageReader::with_format(Cursor::new(bytes), ImageFormat::Png).into_dimensions()?;
            if width <= MAX_API_DIMENSION && height <= MAX_API_DIMENSION {
                return Ok(bytes.to_vec());
            }
        }
        ImageFormat::Jpeg => {}
        other => return Err(ImagingError::Unsupported(other)),
    }

    let mut img = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = img.dimensions();
    if width > MAX_API_DIMENSION || height > MAX_API_DIMENSION {
        img = img.resize(MAX_API_DIMENSION, MAX_API_DIMENSION, FilterType::Lanczos3);
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
