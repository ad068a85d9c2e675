//! Synthetic images shared by the integration tests.

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// Flat orange-red disc on a near-black surround, like a well exposed
/// fundus photograph. Quality comes out high at 224x224 and above.
pub fn synthetic_fundus(size: u32) -> RgbImage {
    let c = size as f32 / 2.0;
    let radius = size as f32 * 0.45;
    RgbImage::from_fn(size, size, |x, y| {
        let (dx, dy) = (x as f32 + 0.5 - c, y as f32 + 0.5 - c);
        if (dx * dx + dy * dy).sqrt() < radius {
            Rgb([190, 90, 60])
        } else {
            Rgb([5, 3, 3])
        }
    })
}

/// Evenly lit gray card: no dark surround, no red tones.
pub fn gray_card(size: u32) -> RgbImage {
    RgbImage::from_pixel(size, size, Rgb([128, 128, 128]))
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

pub fn write_png(dir: &Path, name: &str, img: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    img.save(&path).expect("write png");
    path
}
