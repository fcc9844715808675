// ============================================================================
// Offset fields — construction, repair utilities, visualization, dumps
// ============================================================================
//
// An offset field maps every target pixel to its current best source patch
// center: `source = target + field[target]`.  Everything here is a pure
// function over the field, usable without a live search engine.

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::buffer::{Image, ImageError};
use crate::geometry::Offset;
use crate::pixel::Alpha8;

pub type OffsetField = Image<Offset>;

// ============================================================================
// Seedable PRNG
// ============================================================================

/// Linear congruential generator.  Deterministic per seed, one instance per
/// engine (or per tile in the parallel pass) — never shared global state.
#[derive(Clone, Debug)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    const MUL: u64 = 6364136223846793005;
    const ADD: u64 = 1442695040888963407;

    pub fn new(seed: u64) -> Self {
        // One warm-up step so nearby seeds diverge immediately.
        let mut rng = Lcg {
            state: seed.wrapping_mul(Self::MUL).wrapping_add(Self::ADD),
        };
        rng.next_u32();
        rng
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(Self::MUL).wrapping_add(Self::ADD);
        (self.state >> 32) as u32
    }

    /// Uniform draw from the half-open range `[min, max)`.
    #[inline]
    pub fn uniform(&mut self, min: i32, max: i32) -> i32 {
        debug_assert!(min < max);
        let range = (max - min) as u64;
        min + ((self.next_u32() as u64 * range) >> 32) as i32
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Uniformly random valid source patch center for every target patch center.
/// The border band (within `half` of the field edge) keeps zero offsets.
pub fn make_random_field(
    target_w: i32,
    target_h: i32,
    source_w: i32,
    source_h: i32,
    half: i32,
    seed: u64,
) -> Result<OffsetField, ImageError> {
    let mut field = OffsetField::new(target_w, target_h)?;
    let mut rng = Lcg::new(seed);
    for y in half..target_h - half {
        for x in half..target_w - half {
            let sx = rng.uniform(half, source_w - half);
            let sy = rng.uniform(half, source_h - half);
            field.set_pixel(x, y, Offset::between(x, y, sx, sy));
        }
    }
    Ok(field)
}

/// Deterministic linear mapping `source = target * source_size / target_size`,
/// used to seed coherent structure on nearly-aligned images.
pub fn make_smooth_field(
    target_w: i32,
    target_h: i32,
    source_w: i32,
    source_h: i32,
    half: i32,
) -> Result<OffsetField, ImageError> {
    let mut field = OffsetField::new(target_w, target_h)?;
    for y in half..target_h - half {
        for x in half..target_w - half {
            let sx = x * source_w / target_w;
            let sy = y * source_h / target_h;
            field.set_pixel(x, y, Offset::between(x, y, sx, sy));
        }
    }
    Ok(field)
}

// ============================================================================
// Repair utilities
// ============================================================================

/// Relocate every offset that lands in a masked-out source region.
///
/// The source coordinate is perturbed by a random radius that doubles every
/// two attempts, clamped to the valid patch-center bounds each step.  When
/// `max_iterations` attempts all land on masked pixels the offset is left
/// pointing at one — synthesis proceeds with degraded quality rather than
/// failing.
pub fn remove_masked_offsets(
    field: &mut OffsetField,
    mask: &Image<Alpha8>,
    half: i32,
    max_iterations: u32,
    seed: u64,
) {
    let mut rng = Lcg::new(seed);
    let left = half;
    let right = mask.width() - half;
    let top = half;
    let bottom = mask.height() - half;
    for y in half..field.height() - half {
        for x in half..field.width() - half {
            let (sx, sy) = field.pixel(x, y).apply(x, y);
            if !mask.pixel(sx, sy).is_masked() {
                continue;
            }
            let mut nsx = sx;
            let mut nsy = sy;
            let mut r = 2;
            let mut i = 0;
            loop {
                nsx = (nsx + rng.uniform(-r, r + 1)).clamp(left, right - 1);
                nsy = (nsy + rng.uniform(-r, r + 1)).clamp(top, bottom - 1);
                i += 1;
                if i % 2 == 0 {
                    r *= 2;
                }
                if !mask.pixel(nsx, nsy).is_masked() || i > max_iterations {
                    break;
                }
            }
            field.set_pixel(x, y, Offset::between(x, y, nsx, nsy));
        }
    }
}

/// Clamp offsets so every implied source coordinate stays a valid patch
/// center.
pub fn clamp_field(field: &mut OffsetField, source_w: i32, source_h: i32, half: i32) {
    for y in half..field.height() - half {
        for x in half..field.width() - half {
            let (sx, sy) = field.pixel(x, y).apply(x, y);
            let cx = sx.clamp(half, source_w - half - 1);
            let cy = sy.clamp(half, source_h - half - 1);
            field.set_pixel(x, y, Offset::between(x, y, cx, cy));
        }
    }
}

/// Add bounded random jitter to every offset, then clamp.  Decorrelates a
/// too-regular field (e.g. one produced by `make_smooth_field` or by
/// upscaling).
pub fn shake_field(
    field: &mut OffsetField,
    shake_radius: i32,
    source_w: i32,
    source_h: i32,
    half: i32,
    seed: u64,
) {
    let mut rng = Lcg::new(seed);
    for y in half..field.height() - half {
        for x in half..field.width() - half {
            let (sx, sy) = field.pixel(x, y).apply(x, y);
            let jx = sx + rng.uniform(-shake_radius, shake_radius + 1);
            let jy = sy + rng.uniform(-shake_radius, shake_radius + 1);
            let cx = jx.clamp(half, source_w - half - 1);
            let cy = jy.clamp(half, source_h - half - 1);
            field.set_pixel(x, y, Offset::between(x, y, cx, cy));
        }
    }
}

/// Double an offset field to `new_w × new_h` for the next pyramid level:
/// each new pixel inherits the offset of its half-resolution parent, scaled
/// by two, then the whole field is clamped against the new source bounds.
pub fn upscale_field(
    field: &OffsetField,
    new_w: i32,
    new_h: i32,
    source_w: i32,
    source_h: i32,
    half: i32,
) -> Result<OffsetField, ImageError> {
    let mut out = OffsetField::new(new_w, new_h)?;
    for y in 0..new_h {
        for x in 0..new_w {
            let px = (x / 2).min(field.width() - 1);
            let py = (y / 2).min(field.height() - 1);
            let o = field.pixel(px, py);
            out.set_pixel(
                x,
                y,
                Offset::new(
                    (o.dx as i32 * 2).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                    (o.dy as i32 * 2).clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                ),
            );
        }
    }
    clamp_field(&mut out, source_w, source_h, half);
    Ok(out)
}

// ============================================================================
// Visualization
// ============================================================================

/// Render offsets as an HSV wheel: hue encodes direction, saturation encodes
/// magnitude (saturating around 40 px), constant value.
pub fn field_to_rgba(field: &OffsetField) -> RgbaImage {
    let mut out = RgbaImage::new(field.width() as u32, field.height() as u32);
    for y in 0..field.height() {
        for x in 0..field.width() {
            let o = field.pixel(x, y);
            let (dx, dy) = (o.dx as f64, o.dy as f64);
            let len = (dx * dx + dy * dy).sqrt();
            let hue = dy.atan2(dx).rem_euclid(std::f64::consts::TAU) / std::f64::consts::TAU
                * 360.0;
            let sat = (len / 40.0).min(1.0);
            let val = 0.8;
            let (r, g, b) = hsv_to_rgb(hue, sat, val);
            out.put_pixel(x as u32, y as u32, Rgba([r, g, b, 255]));
        }
    }
    out
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let h_i = ((h / 60.0).floor() as i32).rem_euclid(6);
    let f = h / 60.0 - (h / 60.0).floor();
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match h_i {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    (
        (r * 255.0).clamp(0.0, 255.0) as u8,
        (g * 255.0).clamp(0.0, 255.0) as u8,
        (b * 255.0).clamp(0.0, 255.0) as u8,
    )
}

// ============================================================================
// Binary field dumps (.nnf)
// ============================================================================

const NNF_MAGIC: &str = "NNF1";

#[derive(Serialize, Deserialize)]
struct FieldFile {
    magic: String,
    width: i32,
    height: i32,
    offsets: Vec<Offset>,
}

/// Serialize a field to a `.nnf` debug dump.
pub fn save_field(field: &OffsetField, path: &std::path::Path) -> Result<(), String> {
    let file = FieldFile {
        magic: NNF_MAGIC.to_string(),
        width: field.width(),
        height: field.height(),
        offsets: field.pixels().to_vec(),
    };
    let bytes = bincode::serialize(&file).map_err(|e| format!("field encode error: {}", e))?;
    std::fs::write(path, bytes).map_err(|e| format!("field write error: {}", e))
}

/// Load a `.nnf` dump written by [`save_field`].
pub fn load_field(path: &std::path::Path) -> Result<OffsetField, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("field read error: {}", e))?;
    let file: FieldFile =
        bincode::deserialize(&bytes).map_err(|e| format!("field decode error: {}", e))?;
    if file.magic != NNF_MAGIC {
        return Err(format!("not an NNF dump: bad magic {:?}", file.magic));
    }
    OffsetField::from_vec(file.width, file.height, file.offsets)
        .map_err(|e| format!("field dump corrupt: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;

    const HALF: i32 = 3;

    fn offsets_valid(field: &OffsetField, source_w: i32, source_h: i32) -> bool {
        let rect = Rect::patch_centers(source_w, source_h, HALF);
        for y in HALF..field.height() - HALF {
            for x in HALF..field.width() - HALF {
                let (sx, sy) = field.pixel(x, y).apply(x, y);
                if !rect.contains(sx, sy) {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn lcg_uniform_covers_the_full_range() {
        let mut rng = Lcg::new(42);
        let mut seen = [false; 10];
        for _ in 0..1000 {
            let v = rng.uniform(0, 10);
            assert!((0..10).contains(&v));
            seen[v as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "uniform draws skipped a bucket");
    }

    #[test]
    fn random_field_is_valid_and_deterministic() {
        let a = make_random_field(32, 24, 48, 40, HALF, 7).unwrap();
        let b = make_random_field(32, 24, 48, 40, HALF, 7).unwrap();
        let c = make_random_field(32, 24, 48, 40, HALF, 8).unwrap();
        assert!(offsets_valid(&a, 48, 40));
        assert_eq!(a.pixels(), b.pixels());
        assert_ne!(a.pixels(), c.pixels());
    }

    #[test]
    fn smooth_field_linear_mapping() {
        let f = make_smooth_field(32, 32, 64, 64, HALF).unwrap();
        // source = target * 64 / 32 = 2 * target
        assert_eq!(f.pixel(10, 12).apply(10, 12), (20, 24));
        assert!(offsets_valid(&f, 64, 64));
    }

    #[test]
    fn clamp_pulls_offsets_in_bounds() {
        let mut f = OffsetField::new(20, 20).unwrap();
        f.set_pixel(10, 10, Offset::new(500, -500));
        clamp_field(&mut f, 30, 30, HALF);
        assert!(offsets_valid(&f, 30, 30));
    }

    #[test]
    fn shake_keeps_offsets_in_bounds() {
        let mut f = make_smooth_field(32, 32, 32, 32, HALF).unwrap();
        shake_field(&mut f, 10, 32, 32, HALF, 3);
        assert!(offsets_valid(&f, 32, 32));
    }

    #[test]
    fn masked_offsets_are_relocated() {
        // Mask out a band of the source; a field pointing straight into it
        // must be repaired to point elsewhere.
        let mask = Image::from_fn(40, 40, |x, _| {
            if (10..20).contains(&x) {
                Alpha8::new(0)
            } else {
                Alpha8::OPAQUE
            }
        })
        .unwrap();
        let mut field = make_smooth_field(40, 40, 40, 40, HALF).unwrap();
        remove_masked_offsets(&mut field, &mask, HALF, 40, 99);
        for y in HALF..40 - HALF {
            for x in HALF..40 - HALF {
                let (sx, sy) = field.pixel(x, y).apply(x, y);
                assert!(
                    !mask.pixel(sx, sy).is_masked(),
                    "offset at ({}, {}) still points into the mask",
                    x,
                    y
                );
            }
        }
        assert!(offsets_valid(&field, 40, 40));
    }

    #[test]
    fn field_dump_roundtrip() {
        let f = make_random_field(16, 16, 16, 16, HALF, 1).unwrap();
        let dir = std::env::temp_dir().join("patchfill-field-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.nnf");
        save_field(&f, &path).unwrap();
        let g = load_field(&path).unwrap();
        assert_eq!(f.pixels(), g.pixels());
    }

    #[test]
    fn upscale_doubles_offsets() {
        let mut f = OffsetField::new(16, 16).unwrap();
        f.set_pixel(8, 8, Offset::new(3, -2));
        let up = upscale_field(&f, 32, 32, 64, 64, HALF).unwrap();
        assert_eq!(up.pixel(16, 16), Offset::new(6, -4));
        assert_eq!(up.pixel(17, 17), Offset::new(6, -4));
    }
}
