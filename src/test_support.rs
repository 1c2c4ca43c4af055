//! Fixtures shared by unit tests across modules.

use image::{DynamicImage, Rgb, RgbImage};

/// Deterministic high-entropy image; compresses badly at quality 100.
pub fn noisy_image(width: u32, height: u32) -> RgbImage {
    let mut state: u32 = 0x9E37_79B9;
    RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    })
}

/// A noisy JPEG encoded at `quality`.
pub fn noisy_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let mut out = Vec::new();
    crate::services::engine::raster::encode(
        &DynamicImage::ImageRgb8(noisy_image(width, height)),
        "jpg",
        quality,
        &mut out,
    )
    .unwrap();
    out
}
