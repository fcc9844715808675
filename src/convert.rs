// ============================================================================
// Pixel-format conversions at the codec boundary
// ============================================================================
//
// The search core is generic over `PixelOps`; these helpers move between the
// codec-facing RGBA buffers and the core pixel types.  Lab channels are
// stored normalized to [0, 1]; the distance function restores the real
// channel ranges (see `pixel.rs`).

use image::{GrayImage, Luma, Rgba, RgbaImage};

use crate::buffer::Image;
use crate::pixel::{Alpha8, LabF32, Rgb8};

const LAB_A_MIN: f32 = -91.3727;
const LAB_A_RANGE: f32 = 96.7768 + 91.3727;
const LAB_B_MIN: f32 = -125.845;
const LAB_B_RANGE: f32 = 81.7356 + 125.845;

pub fn rgba_to_rgb8(src: &RgbaImage) -> Image<Rgb8> {
    Image::from_fn(src.width() as i32, src.height() as i32, |x, y| {
        let p = src.get_pixel(x as u32, y as u32);
        Rgb8::new(p.0[0], p.0[1], p.0[2])
    })
    .expect("decoded images are never empty")
}

pub fn rgb8_to_rgba(src: &Image<Rgb8>) -> RgbaImage {
    let mut out = RgbaImage::new(src.width() as u32, src.height() as u32);
    for y in 0..src.height() {
        for x in 0..src.width() {
            let p = src.pixel(x, y);
            out.put_pixel(x as u32, y as u32, Rgba([p.r, p.g, p.b, 255]));
        }
    }
    out
}

pub fn rgba_to_lab(src: &RgbaImage) -> Image<LabF32> {
    Image::from_fn(src.width() as i32, src.height() as i32, |x, y| {
        let p = src.get_pixel(x as u32, y as u32);
        srgb_to_lab(p.0[0], p.0[1], p.0[2])
    })
    .expect("decoded images are never empty")
}

pub fn lab_to_rgba(src: &Image<LabF32>) -> RgbaImage {
    let mut out = RgbaImage::new(src.width() as u32, src.height() as u32);
    for y in 0..src.height() {
        for x in 0..src.width() {
            let (r, g, b) = lab_to_srgb(src.pixel(x, y));
            out.put_pixel(x as u32, y as u32, Rgba([r, g, b, 255]));
        }
    }
    out
}

/// Grayscale importance values, taken as-is (bright = important).
pub fn mask_from_gray(src: &GrayImage) -> Image<Alpha8> {
    Image::from_fn(src.width() as i32, src.height() as i32, |x, y| {
        Alpha8::new(src.get_pixel(x as u32, y as u32).0[0])
    })
    .expect("decoded images are never empty")
}

/// The usual hole-mask convention (bright = remove) flipped into an
/// importance mask (bright = keep).
pub fn importance_from_hole_mask(src: &GrayImage) -> Image<Alpha8> {
    Image::from_fn(src.width() as i32, src.height() as i32, |x, y| {
        let hole = src.get_pixel(x as u32, y as u32).0[0] >= 128;
        if hole { Alpha8::new(0) } else { Alpha8::OPAQUE }
    })
    .expect("decoded images are never empty")
}

/// Importance mask rendered back to grayscale (debug artifacts).
pub fn mask_to_gray(src: &Image<Alpha8>) -> GrayImage {
    let mut out = GrayImage::new(src.width() as u32, src.height() as u32);
    for y in 0..src.height() {
        for x in 0..src.width() {
            out.put_pixel(x as u32, y as u32, Luma([src.pixel(x, y).a]));
        }
    }
    out
}

// ---- sRGB <-> CIE Lab (D65 white point) -----------------------------------

fn srgb_channel_to_linear(c: u8) -> f32 {
    let c = c as f32 / 255.0;
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_channel_to_srgb(c: f32) -> u8 {
    let c = if c <= 0.0031308 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (c * 255.0).round().clamp(0.0, 255.0) as u8
}

const XN: f32 = 0.95047;
const YN: f32 = 1.0;
const ZN: f32 = 1.08883;

fn lab_f(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(t: f32) -> f32 {
    const DELTA: f32 = 6.0 / 29.0;
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

fn srgb_to_lab(r: u8, g: u8, b: u8) -> LabF32 {
    let rl = srgb_channel_to_linear(r);
    let gl = srgb_channel_to_linear(g);
    let bl = srgb_channel_to_linear(b);

    let x = 0.4124564 * rl + 0.3575761 * gl + 0.1804375 * bl;
    let y = 0.2126729 * rl + 0.7151522 * gl + 0.0721750 * bl;
    let z = 0.0193339 * rl + 0.1191920 * gl + 0.9503041 * bl;

    let fx = lab_f(x / XN);
    let fy = lab_f(y / YN);
    let fz = lab_f(z / ZN);

    let l = 116.0 * fy - 16.0;
    let a = 500.0 * (fx - fy);
    let b = 200.0 * (fy - fz);

    LabF32::new(
        (l / 100.0).clamp(0.0, 1.0),
        ((a - LAB_A_MIN) / LAB_A_RANGE).clamp(0.0, 1.0),
        ((b - LAB_B_MIN) / LAB_B_RANGE).clamp(0.0, 1.0),
    )
}

fn lab_to_srgb(p: LabF32) -> (u8, u8, u8) {
    let l = p.l * 100.0;
    let a = p.a * LAB_A_RANGE + LAB_A_MIN;
    let b = p.b * LAB_B_RANGE + LAB_B_MIN;

    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;

    let x = XN * lab_f_inv(fx);
    let y = YN * lab_f_inv(fy);
    let z = ZN * lab_f_inv(fz);

    let rl = 3.2404542 * x - 1.5371385 * y - 0.4985314 * z;
    let gl = -0.9692660 * x + 1.8760108 * y + 0.0415560 * z;
    let bl = 0.0556434 * x - 0.2040259 * y + 1.0572252 * z;

    (
        linear_channel_to_srgb(rl.clamp(0.0, 1.0)),
        linear_channel_to_srgb(gl.clamp(0.0, 1.0)),
        linear_channel_to_srgb(bl.clamp(0.0, 1.0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_roundtrip_is_close() {
        for (r, g, b) in [
            (0u8, 0u8, 0u8),
            (255, 255, 255),
            (255, 0, 0),
            (0, 255, 0),
            (0, 0, 255),
            (128, 64, 200),
            (17, 230, 99),
        ] {
            let lab = srgb_to_lab(r, g, b);
            let (r2, g2, b2) = lab_to_srgb(lab);
            assert!(
                (r as i32 - r2 as i32).abs() <= 2
                    && (g as i32 - g2 as i32).abs() <= 2
                    && (b as i32 - b2 as i32).abs() <= 2,
                "({}, {}, {}) came back as ({}, {}, {})",
                r,
                g,
                b,
                r2,
                g2,
                b2
            );
        }
    }

    #[test]
    fn gray_is_neutral_in_lab() {
        let lab = srgb_to_lab(128, 128, 128);
        // a and b sit near the middle of their normalized ranges.
        assert!((lab.a - (-LAB_A_MIN / LAB_A_RANGE)).abs() < 0.02);
        assert!((lab.b - (-LAB_B_MIN / LAB_B_RANGE)).abs() < 0.02);
    }

    #[test]
    fn hole_mask_inversion() {
        let mut gray = GrayImage::new(2, 1);
        gray.put_pixel(0, 0, Luma([255]));
        gray.put_pixel(1, 0, Luma([0]));
        let importance = importance_from_hole_mask(&gray);
        assert!(importance.pixel(0, 0).is_masked());
        assert!(!importance.pixel(1, 0).is_masked());
    }
}
