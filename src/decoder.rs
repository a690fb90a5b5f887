use image::imageops::FilterType;

use crate::error::DecodeError;
use crate::types::{DecodedImage, ImageDescriptor};

/// Default downscale threshold in pixels.
pub const DEFAULT_MAX_DIMENSION: u32 = 512;

/// Decode raw bytes into an 8-bit RGB image.
///
/// The format is sniffed from the content. Images wider or taller than
/// `max_dimension` are downscaled to fit inside a `max_dimension` square,
/// preserving aspect ratio.
pub fn decode_image(
    descriptor: &ImageDescriptor,
    max_dimension: u32,
) -> Result<DecodedImage, DecodeError> {
    let mut image = image::load_from_memory(&descriptor.bytes)?;

    if image.width() > max_dimension || image.height() > max_dimension {
        let (w, h) = (image.width(), image.height());
        image = image.resize(max_dimension, max_dimension, FilterType::Lanczos3);
        tracing::debug!(
            "Resized {} from {}x{} to {}x{}",
            descriptor.identifier,
            w,
            h,
            image.width(),
            image.height()
        );
    }

    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    if width == 0 || height == 0 {
        return Err(DecodeError::Unsupported("image has no pixels".to_string()));
    }

    Ok(DecodedImage {
        identifier: descriptor.identifier.clone(),
        image: rgb,
        width,
        height,
    })
}

/// Decode every descriptor, keeping failures in place.
pub fn decode_all(
    descriptors: Vec<ImageDescriptor>,
    max_dimension: u32,
) -> Vec<Result<DecodedImage, (String, DecodeError)>> {
    descriptors
        .into_iter()
        .map(|descriptor| {
            decode_image(&descriptor, max_dimension).map_err(|e| {
                tracing::warn!("Failed to decode {}: {}", descriptor.identifier, e);
                (descriptor.identifier, e)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([10, 20, 30, 128]),
        ));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn descriptor(bytes: Vec<u8>) -> ImageDescriptor {
        ImageDescriptor {
            identifier: "test.png".to_string(),
            bytes,
        }
    }

    #[test]
    fn small_image_keeps_size_and_becomes_rgb() {
        let decoded = decode_image(&descriptor(png(40, 30)), DEFAULT_MAX_DIMENSION).unwrap();
        assert_eq!((decoded.width, decoded.height), (40, 30));
        assert_eq!(decoded.image.dimensions(), (40, 30));
        assert_eq!(decoded.identifier, "test.png");
    }

    #[test]
    fn large_image_is_downscaled_preserving_aspect() {
        let decoded = decode_image(&descriptor(png(1024, 256)), DEFAULT_MAX_DIMENSION).unwrap();
        assert_eq!((decoded.width, decoded.height), (512, 128));

        let tall = decode_image(&descriptor(png(300, 900)), DEFAULT_MAX_DIMENSION).unwrap();
        assert_eq!(tall.height, 512);
        assert!(tall.width <= 171 && tall.width >= 170);
    }

    #[test]
    fn garbage_is_unknown_format() {
        let err = decode_image(&descriptor(b"not an image".to_vec()), 512).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFormat));
    }

    #[test]
    fn truncated_png_is_corrupt() {
        let mut bytes = png(64, 64);
        bytes.truncate(40);
        let err = decode_image(&descriptor(bytes), 512).unwrap_err();
        assert!(!matches!(err, DecodeError::UnknownFormat));
    }

    #[test]
    fn decode_all_keeps_order_and_failures() {
        let results = decode_all(
            vec![
                descriptor(png(8, 8)),
                ImageDescriptor {
                    identifier: "broken".to_string(),
                    bytes: vec![0, 1, 2],
                },
                descriptor(png(4, 4)),
            ],
            512,
        );
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().0, "broken");
        assert!(results[2].is_ok());
    }
}
