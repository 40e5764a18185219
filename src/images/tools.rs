use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::gif::GifDecoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, ColorType, DynamicImage, GenericImageView, ImageEncoder, ImageFormat};

use crate::images::{
    ImageError, ImageFit, OutputFormat, TransformParams, ValidationError, MAX_DIMENSION,
    MAX_OUTPUT_PIXELS,
};

// 1 (slowest, smallest) to 10 (fastest)
const AVIF_SPEED: u8 = 8;

/// Decode `image_data`, apply `params` and encode the result.
///
/// Returns the encoded bytes and their mime type. When `params.format` is
/// `None` the source format is kept if we can encode it, PNG otherwise.
pub fn convert_image(
    image_data: &[u8],
    params: &TransformParams,
    source_mime: &str,
) -> Result<(Vec<u8>, &'static str), ImageError> {
    params.validate()?;

    let img = image::load_from_memory(image_data)
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    let processed_img = resize_image(img, params)?;

    let format = params
        .format
        .or_else(|| OutputFormat::from_mime(source_mime))
        .unwrap_or(OutputFormat::Png);

    let output = encode_image(&processed_img, format, params.quality)?;
    Ok((output, format.mime()))
}

/// True when the GIF has more than one frame.
pub fn is_animated_gif(image_data: &[u8]) -> bool {
    match GifDecoder::new(Cursor::new(image_data)) {
        Ok(decoder) => decoder.into_frames().take(2).count() > 1,
        Err(_) => false,
    }
}

fn resize_image(img: DynamicImage, params: &TransformParams) -> Result<DynamicImage, ImageError> {
    let (current_width, current_height) = img.dimensions();

    let resized = match (params.width, params.height) {
        (0, 0) => img,
        (width, 0) => {
            // Width only: keep the aspect ratio and never enlarge
            if width >= current_width {
                return Ok(img);
            }
            let height = scale_dimension(current_height, width, current_width);
            img.resize_exact(width, height, FilterType::Lanczos3)
        }
        (width, height) => {
            let width = if width == 0 {
                scale_dimension(current_width, height, current_height)
            } else {
                width
            };
            check_output_size(width, height)?;

            match params.fit {
                ImageFit::Fill => img.resize_exact(width, height, FilterType::Lanczos3),
                ImageFit::Cover => {
                    crop_to_aspect(&img, width, height).resize_exact(width, height, FilterType::Lanczos3)
                }
                ImageFit::Contain => {
                    let resized = img.resize(width, height, FilterType::Lanczos3);
                    pad_image(resized, width, height)
                }
                ImageFit::Inside => img.resize(width, height, FilterType::Lanczos3),
                ImageFit::Outside => {
                    let scale_x = width as f64 / current_width as f64;
                    let scale_y = height as f64 / current_height as f64;
                    let scale = scale_x.max(scale_y);
                    let scaled_width = scale_to_u32(current_width as f64 * scale);
                    let scaled_height = scale_to_u32(current_height as f64 * scale);
                    check_output_size(scaled_width, scaled_height)?;
                    img.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3)
                }
            }
        }
    };

    Ok(resized)
}

// Scaled intermediates are allocated in full, bound them before resizing
fn check_output_size(width: u32, height: u32) -> Result<(), ValidationError> {
    if width > MAX_DIMENSION {
        return Err(ValidationError::InvalidDimension("w", width.to_string()));
    }
    if height > MAX_DIMENSION {
        return Err(ValidationError::InvalidDimension("h", height.to_string()));
    }
    if width as u64 * height as u64 > MAX_OUTPUT_PIXELS {
        return Err(ValidationError::OutputTooLarge(width, height));
    }
    Ok(())
}

// Centre crop to the aspect ratio of `width` x `height`
fn crop_to_aspect(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (current_width, current_height) = img.dimensions();

    let target_ratio = width as f64 / height as f64;
    let current_ratio = current_width as f64 / current_height as f64;

    let (crop_width, crop_height) = if current_ratio > target_ratio {
        let crop_width = scale_dimension(current_height, width, height).min(current_width);
        (crop_width, current_height)
    } else {
        let crop_height = scale_dimension(current_width, height, width).min(current_height);
        (current_width, crop_height)
    };

    img.crop_imm(
        (current_width - crop_width) / 2,
        (current_height - crop_height) / 2,
        crop_width,
        crop_height,
    )
}

fn scale_to_u32(value: f64) -> u32 {
    (value.round() as u32).max(1)
}

// `value * numerator / denominator`, rounded, at least 1
fn scale_dimension(value: u32, numerator: u32, denominator: u32) -> u32 {
    scale_to_u32(value as f64 * numerator as f64 / denominator as f64)
}

fn pad_image(img: DynamicImage, target_width: u32, target_height: u32) -> DynamicImage {
    let (current_width, current_height) = img.dimensions();

    if current_width == target_width && current_height == target_height {
        return img;
    }

    // Transparent canvas with the image centred on it
    let mut padded = DynamicImage::new_rgba8(target_width, target_height);
    let x_offset = (target_width.saturating_sub(current_width)) / 2;
    let y_offset = (target_height.saturating_sub(current_height)) / 2;
    image::imageops::overlay(&mut padded, &img, x_offset as i64, y_offset as i64);

    padded
}

fn encode_image(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut output = Vec::new();
    let (width, height) = img.dimensions();

    match format {
        OutputFormat::Webp => {
            // Lossless encoder, quality does not apply
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut output), ImageFormat::WebP)
                .map_err(|e| ImageError::Conversion(format!("WebP encoding failed: {}", e)))?;
        }
        OutputFormat::Avif => {
            let rgba = img.to_rgba8();
            AvifEncoder::new_with_speed_quality(&mut output, AVIF_SPEED, quality.min(100))
                .write_image(rgba.as_raw(), width, height, ColorType::Rgba8)
                .map_err(|e| ImageError::Conversion(format!("AVIF encoding failed: {}", e)))?;
        }
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.min(100));
            encoder
                .encode(rgb.as_raw(), width, height, ColorType::Rgb8)
                .map_err(|e| ImageError::Conversion(format!("JPEG encoding failed: {}", e)))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
                .map_err(|e| ImageError::Conversion(format!("PNG encoding failed: {}", e)))?;
        }
        OutputFormat::Gif => {
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut output), ImageFormat::Gif)
                .map_err(|e| ImageError::Conversion(format!("GIF encoding failed: {}", e)))?;
        }
    }

    Ok(output)
}
