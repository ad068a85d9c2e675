//! Deterministic transform from a decoded image to a model-ready tensor.
//!
//! Steps, always in this order:
//! format normalization, tile-based histogram equalization, sharpening and
//! saturation touch-up, brightness normalization, ROI centering, aspect
//! preserving resize with zero padding, and scaling to [0, 1].

use crate::clahe;
use crate::error::PreprocessError;
use crate::quality_assessment::LUMA_WEIGHTS;
use crate::thresholds::PreprocessThresholds;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::Serialize;

/// Preprocessed image, `(height, width, 3)` with values in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Array3<f32>,
}

impl Tensor {
    pub fn new(data: Array3<f32>) -> Result<Self, PreprocessError> {
        let (h, w, c) = data.dim();
        if c != 3 {
            return Err(PreprocessError::UnsupportedFormat {
                channels: c.min(u8::MAX as usize) as u8,
            });
        }
        if h == 0 || w == 0 {
            return Err(PreprocessError::EmptyImage);
        }
        Ok(Self { data })
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// NHWC batch of one, the layout the classifier graph expects.
    pub fn to_batched(&self) -> Array4<f32> {
        self.data.clone().insert_axis(Axis(0))
    }

    /// Back to 8-bit RGB, used for overlays.
    pub fn to_rgb_image(&self) -> RgbImage {
        let (h, w, _) = self.data.dim();
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let px = |c: usize| (self.data[[y as usize, x as usize, c]] * 255.0).round().clamp(0.0, 255.0) as u8;
            Rgb([px(0), px(1), px(2)])
        })
    }
}

/// Before/after statistics for the enhancement steps, recorded in the
/// per-image metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PreprocessingMetadata {
    pub original_width: u32,
    pub original_height: u32,
    /// Channel count of the source before normalization
    pub source_channels: u8,
    pub contrast_before: f32,
    pub contrast_after: f32,
    /// Laplacian variance
    pub sharpness_before: f32,
    pub sharpness_after: f32,
    pub brightness_before: f32,
    pub brightness_after: f32,
    /// Multiplicative factor applied in the brightness step (1.0 when untouched)
    pub brightness_factor: f32,
    /// Translation applied by ROI centering, in source pixels
    pub roi_shift: (i32, i32),
    pub resize_scale: f32,
    /// Left and top zero padding in target pixels
    pub padding: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct PreprocessOutput {
    pub tensor: Tensor,
    pub metadata: PreprocessingMetadata,
}

/// Build an RGB image from a raw interleaved 8-bit buffer.
///
/// One and two channel buffers are treated as gray (+ alpha), four channel
/// buffers as RGBA. Any other layout is rejected.
pub fn rgb_from_interleaved(
    bytes: &[u8],
    width: u32,
    height: u32,
    channels: u8,
) -> Result<RgbImage, PreprocessError> {
    if !(1..=4).contains(&channels) {
        return Err(PreprocessError::UnsupportedFormat { channels });
    }
    if width == 0 || height == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    let expected = width as usize * height as usize * channels as usize;
    if bytes.len() != expected {
        return Err(PreprocessError::BufferSize {
            expected,
            actual: bytes.len(),
        });
    }

    let stride = channels as usize;
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let i = (y as usize * width as usize + x as usize) * stride;
        match channels {
            1 | 2 => Rgb([bytes[i]; 3]),
            _ => Rgb([bytes[i], bytes[i + 1], bytes[i + 2]]),
        }
    }))
}

/// Normalize any decoded image to 8-bit RGB.
pub fn normalize_format(img: &DynamicImage) -> Result<RgbImage, PreprocessError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    match img.color().channel_count() {
        1 | 2 => {
            let gray = img.to_luma8();
            Ok(RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
                let v = gray.get_pixel(x, y)[0];
                Rgb([v, v, v])
            }))
        }
        3 | 4 => Ok(img.to_rgb8()),
        channels => Err(PreprocessError::UnsupportedFormat { channels }),
    }
}

#[derive(Clone, Debug)]
pub struct ImagePreprocessor {
    target: (u32, u32),
    params: PreprocessThresholds,
}

impl ImagePreprocessor {
    /// `target` is `(width, height)` of the model input.
    pub fn new(target: (u32, u32), params: PreprocessThresholds) -> Self {
        Self { target, params }
    }

    pub fn target(&self) -> (u32, u32) {
        self.target
    }

    pub fn preprocess(&self, img: &DynamicImage) -> Result<PreprocessOutput, PreprocessError> {
        let rgb = normalize_format(img)?;
        self.run(rgb, img.color().channel_count())
    }

    pub fn preprocess_interleaved(
        &self,
        bytes: &[u8],
        width: u32,
        height: u32,
        channels: u8,
    ) -> Result<PreprocessOutput, PreprocessError> {
        let rgb = rgb_from_interleaved(bytes, width, height, channels)?;
        self.run(rgb, channels)
    }

    fn run(&self, rgb: RgbImage, source_channels: u8) -> Result<PreprocessOutput, PreprocessError> {
        let p = &self.params;
        let (original_width, original_height) = rgb.dimensions();
        let before = luma_plane(&rgb);

        let enhanced = clahe::equalize_rgb(&rgb, p.clahe_tiles, p.clahe_clip_limit);
        let sharpened = sharpen(&enhanced, p.sharpen_factor, p.sharpen_sigma);
        let saturated = adjust_saturation(&sharpened, p.saturation_factor);
        let (balanced, brightness_factor) = normalize_brightness(saturated, p);
        let (centered, roi_shift) = center_roi(&balanced, p);
        let after = luma_plane(&centered);

        let (tensor_data, resize_scale, padding) = self.resize_and_pad(&centered);
        let tensor = Tensor::new(tensor_data)?;

        let metadata = PreprocessingMetadata {
            original_width,
            original_height,
            source_channels,
            contrast_before: std_of(&before),
            contrast_after: std_of(&after),
            sharpness_before: laplacian_variance(&before),
            sharpness_after: laplacian_variance(&after),
            brightness_before: mean_of(&before),
            brightness_after: mean_of(&after),
            brightness_factor,
            roi_shift,
            resize_scale,
            padding,
        };
        log::debug!(
            "Preprocessed {original_width}x{original_height} -> {}x{}: brightness x{brightness_factor}, roi shift {:?}, scale {resize_scale:.3}",
            self.target.0,
            self.target.1,
            roi_shift
        );

        Ok(PreprocessOutput { tensor, metadata })
    }

    /// Fit inside the target box, Lanczos3 resample, zero pad centered, scale to [0, 1].
    fn resize_and_pad(&self, img: &RgbImage) -> (Array3<f32>, f32, (u32, u32)) {
        let (tw, th) = self.target;
        let (w, h) = img.dimensions();
        let scale = (tw as f32 / w as f32).min(th as f32 / h as f32);
        let new_w = ((w as f32 * scale).round() as u32).clamp(1, tw);
        let new_h = ((h as f32 * scale).round() as u32).clamp(1, th);

        let resized = image::imageops::resize(
            img,
            new_w,
            new_h,
            image::imageops::FilterType::Lanczos3,
        );

        let x_offset = (tw - new_w) / 2;
        let y_offset = (th - new_h) / 2;

        let mut data = Array3::<f32>::zeros((th as usize, tw as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                data[[(y + y_offset) as usize, (x + x_offset) as usize, c]] =
                    pixel[c] as f32 / 255.0;
            }
        }
        (data, scale, (x_offset, y_offset))
    }
}

fn luma_plane(img: &RgbImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        Luma([luma_of(p).round().clamp(0.0, 255.0) as u8])
    })
}

fn luma_of(p: &Rgb<u8>) -> f32 {
    LUMA_WEIGHTS[0] * p[0] as f32 + LUMA_WEIGHTS[1] * p[1] as f32 + LUMA_WEIGHTS[2] * p[2] as f32
}

fn mean_of(gray: &GrayImage) -> f32 {
    let n = gray.pixels().len().max(1) as f64;
    (gray.pixels().map(|p| p[0] as f64).sum::<f64>() / n) as f32
}

fn std_of(gray: &GrayImage) -> f32 {
    let m = mean_of(gray) as f64;
    let n = gray.pixels().len().max(1) as f64;
    let var = gray.pixels().map(|p| (p[0] as f64 - m).powi(2)).sum::<f64>() / n;
    var.sqrt() as f32
}

fn laplacian_variance(gray: &GrayImage) -> f32 {
    let lap = laplacian_filter(gray);
    let values: Vec<f64> = lap.pixels().map(|p| p[0] as f64).collect();
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n) as f32
}

/// `blur + factor * (orig - blur)`; factor 1.0 is the identity.
fn sharpen(img: &RgbImage, factor: f32, sigma: f32) -> RgbImage {
    let blurred = gaussian_blur_f32(img, sigma);
    blend(img, |x, y, c, v| {
        let b = blurred.get_pixel(x, y)[c] as f32;
        b + factor * (v - b)
    })
}

/// Push each channel away from the pixel's luma.
fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    blend(img, |x, y, _, v| {
        let l = luma_of(img.get_pixel(x, y));
        l + factor * (v - l)
    })
}

fn normalize_brightness(img: RgbImage, p: &PreprocessThresholds) -> (RgbImage, f32) {
    let mean = mean_of(&luma_plane(&img));
    let factor = if mean < p.dark_luminance {
        p.brighten_factor
    } else if mean > p.bright_luminance {
        p.darken_factor
    } else {
        return (img, 1.0);
    };
    (blend(&img, |_, _, _, v| v * factor), factor)
}

fn blend(img: &RgbImage, f: impl Fn(u32, u32, usize, f32) -> f32) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        let ch = |c: usize| f(x, y, c, p[c] as f32).round().clamp(0.0, 255.0) as u8;
        Rgb([ch(0), ch(1), ch(2)])
    })
}

/// Move the brightest blurred region (usually the optic disc) halfway toward
/// the center, per axis, when its offset is moderate.
fn center_roi(img: &RgbImage, p: &PreprocessThresholds) -> (RgbImage, (i32, i32)) {
    let (w, h) = img.dimensions();
    let blurred = gaussian_blur_f32(&luma_plane(img), p.roi_blur_sigma);

    let mut best = (0u32, 0u32);
    let mut best_value = 0u8;
    for (x, y, px) in blurred.enumerate_pixels() {
        if px[0] > best_value {
            best_value = px[0];
            best = (x, y);
        }
    }

    let axis_shift = |pos: u32, dim: u32| -> i32 {
        let offset = pos as f32 - dim as f32 / 2.0;
        let max_offset = dim as f32 / p.roi_max_offset_divisor;
        if offset.abs() > p.roi_min_offset && offset.abs() < max_offset {
            (offset / 2.0) as i32
        } else {
            0
        }
    };
    let shift = (axis_shift(best.0, w), axis_shift(best.1, h));
    if shift == (0, 0) {
        return (img.clone(), shift);
    }

    let shifted = RgbImage::from_fn(w, h, |x, y| {
        let sx = reflect_101(x as i64 + shift.0 as i64, w);
        let sy = reflect_101(y as i64 + shift.1 as i64, h);
        *img.get_pixel(sx, sy)
    });
    (shifted, shift)
}

/// Mirror an out-of-range index without repeating the edge pixel (`dcb|abcd|cba`).
fn reflect_101(i: i64, len: u32) -> u32 {
    let n = len as i64;
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - m }) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, LumaA, Rgba, RgbaImage};

    fn fundus_like(w: u32, h: u32) -> DynamicImage {
        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        let r = w.min(h) as f32 * 0.45;
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            let d = (dx * dx + dy * dy).sqrt();
            if d < r {
                let shade = (170.0 - d * 0.4) as u8;
                Rgb([shade, shade / 2, shade / 3])
            } else {
                Rgb([8, 4, 4])
            }
        }))
    }

    fn preprocessor() -> ImagePreprocessor {
        ImagePreprocessor::new((224, 224), PreprocessThresholds::default())
    }

    #[test]
    fn test_output_shape_and_range() {
        let out = preprocessor().preprocess(&fundus_like(320, 240)).unwrap();
        assert_eq!(out.tensor.view().dim(), (224, 224, 3));
        assert_eq!(out.tensor.to_batched().dim(), (1, 224, 224, 3));
        assert!(out.tensor.view().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert_eq!(out.metadata.padding, (0, 28));
        assert!((out.metadata.resize_scale - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_padding_is_zero() {
        let out = preprocessor().preprocess(&fundus_like(400, 200)).unwrap();
        let view = out.tensor.view();
        let (left, top) = out.metadata.padding;
        assert_eq!(left, 0);
        assert!(top > 0);
        for x in 0..224 {
            for c in 0..3 {
                assert_eq!(view[[0, x, c]], 0.0);
                assert_eq!(view[[223, x, c]], 0.0);
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let img = fundus_like(256, 256);
        let a = preprocessor().preprocess(&img).unwrap();
        let b = preprocessor().preprocess(&img).unwrap();
        assert_eq!(a.tensor, b.tensor);
        assert_eq!(a.metadata, b.metadata);
    }

    #[test]
    fn test_gray_and_rgba_sources_normalized() {
        let gray = DynamicImage::ImageLumaA8(GrayAlphaImage::from_pixel(60, 60, LumaA([90, 255])));
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(60, 60, Rgba([90, 40, 20, 0])));
        for img in [gray, rgba] {
            let out = preprocessor().preprocess(&img).unwrap();
            assert_eq!(out.tensor.view().dim(), (224, 224, 3));
        }
    }

    #[test]
    fn test_interleaved_buffers() {
        let p = preprocessor();
        assert_eq!(
            p.preprocess_interleaved(&[0u8; 10 * 10 * 5], 10, 10, 5).unwrap_err(),
            PreprocessError::UnsupportedFormat { channels: 5 }
        );
        assert_eq!(
            p.preprocess_interleaved(&[0u8; 7], 10, 10, 3).unwrap_err(),
            PreprocessError::BufferSize {
                expected: 300,
                actual: 7
            }
        );
        let rgb = rgb_from_interleaved(&[1, 2, 3, 4, 5, 6, 7, 8], 2, 1, 4).unwrap();
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([5, 6, 7]));
    }

    #[test]
    fn test_dark_image_brightened() {
        let img = RgbImage::from_pixel(64, 64, Rgb([40, 40, 40]));
        let (out, factor) = normalize_brightness(img, &PreprocessThresholds::default());
        assert_eq!(factor, 1.2);
        assert_eq!(out.get_pixel(0, 0), &Rgb([48, 48, 48]));
    }

    #[test]
    fn test_roi_shift_toward_center() {
        let (w, h) = (200u32, 200u32);
        let img = RgbImage::from_fn(w, h, |x, y| {
            let (dx, dy) = (x as f32 - 140.0, y as f32 - 100.0);
            if dx * dx + dy * dy < 100.0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([30, 30, 30])
            }
        });
        let (_, shift) = center_roi(&img, &PreprocessThresholds::default());
        // offset 40 on x is within (20, 50), y is centered
        assert!((17..=22).contains(&shift.0), "{shift:?}");
        assert_eq!(shift.1, 0);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
    }
}
