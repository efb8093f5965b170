use image::imageops::FilterType;

use crate::foundation::core::Dimensions;
use crate::foundation::error::{RenderError, RenderResultT};

/// Decoded cover image (straight-alpha RGBA8).
///
/// Moved into the encoding worker and dropped right after it has been drawn once.
#[derive(Clone, Debug)]
pub struct Bitmap {
    image: image::RgbaImage,
}

impl Bitmap {
    pub fn from_rgba(image: image::RgbaImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decode an encoded image payload (PNG, JPEG, WebP, ..) into a [`Bitmap`].
pub fn load_bitmap(bytes: &[u8]) -> RenderResultT<Bitmap> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| RenderError::image(format!("failed to decode cover image: {e}")))?;
    let rgba = img.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(RenderError::image("cover image has zero size"));
    }
    Ok(Bitmap::from_rgba(rgba))
}

/// One opaque RGBA8 video frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 4` bytes, alpha always 255.
    pub data: Vec<u8>,
}

/// Source rectangle selected by cover-fit scaling.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Centered crop of a `src_w x src_h` image that matches the target aspect ratio.
///
/// Wider sources lose columns on both sides; taller sources lose rows top and bottom. Scaling
/// the crop to the target fills it without letterboxing.
pub fn cover_fit_crop(src_w: u32, src_h: u32, target: Dimensions) -> CropRect {
    let (sw, sh) = (f64::from(src_w), f64::from(src_h));
    let src_aspect = sw / sh;
    let dst_aspect = target.aspect();
    if src_aspect > dst_aspect {
        let width = sh * dst_aspect;
        CropRect {
            x: (sw - width) / 2.0,
            y: 0.0,
            width,
            height: sh,
        }
    } else {
        let height = sw / dst_aspect;
        CropRect {
            x: 0.0,
            y: (sh - height) / 2.0,
            width: sw,
            height,
        }
    }
}

/// Draw `bitmap` cover-fit onto a `target`-sized opaque frame. Consumes the bitmap.
pub fn draw_cover(bitmap: Bitmap, target: Dimensions) -> RenderResultT<VideoFrame> {
    if target.width == 0 || target.height == 0 {
        return Err(RenderError::validation("frame width/height must be non-zero"));
    }
    let (src_w, src_h) = (bitmap.width(), bitmap.height());
    let crop = cover_fit_crop(src_w, src_h, target);

    let x = (crop.x.round() as u32).min(src_w - 1);
    let y = (crop.y.round() as u32).min(src_h - 1);
    let w = (crop.width.round() as u32).clamp(1, src_w - x);
    let h = (crop.height.round() as u32).clamp(1, src_h - y);

    let cropped = image::imageops::crop_imm(&bitmap.image, x, y, w, h).to_image();
    drop(bitmap);

    let scaled = if (w, h) == (target.width, target.height) {
        cropped
    } else {
        image::imageops::resize(&cropped, target.width, target.height, FilterType::Triangle)
    };

    let mut data = scaled.into_raw();
    flatten_over_black(&mut data);
    Ok(VideoFrame {
        width: target.width,
        height: target.height,
        data,
    })
}

/// Composite straight-alpha RGBA8 over opaque black, in place.
fn flatten_over_black(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        let a = u16::from(px[3]);
        if a == 255 {
            continue;
        }
        px[0] = mul_div255(u16::from(px[0]), a) as u8;
        px[1] = mul_div255(u16::from(px[1]), a) as u8;
        px[2] = mul_div255(u16::from(px[2]), a) as u8;
        px[3] = 255;
    }
}

fn mul_div255(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

#[cfg(test)]
#[path = "../tests/unit/raster.rs"]
mod tests;
