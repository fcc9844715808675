// ============================================================================
// Object removal — coarse-to-fine bidirectional-similarity synthesis
// ============================================================================
//
// The hole is synthesized on a Gaussian pyramid: the coarsest level
// converges in a few cheap iterations, and each finer level warm-starts
// from the upscaled result and offset fields of the level below.  Outside
// the hole the output is always the untouched input.

use std::path::PathBuf;

use image::{GrayImage, RgbaImage};

use crate::bds::BidirectionalSimilarity;
use crate::buffer::Image;
use crate::convert::{importance_from_hole_mask, lab_to_rgba, mask_to_gray, rgba_to_lab};
use crate::field::upscale_field;
use crate::io::DebugSink;
use crate::log_info;
use crate::nnf::PatchParams;
use crate::pixel::{Alpha8, LabF32};
use crate::pyramid::{GaussianPyramid, scale_up};

#[derive(Clone, Debug)]
pub struct RemovalParams {
    /// Skip this many of the coarsest pyramid levels (start from a more
    /// detailed LOD).
    pub lod_bias: usize,
    /// Outer synthesis iterations at the finest level; level `i` runs
    /// `min_iterations + iterations_lod_factor * i`.
    pub min_iterations: u32,
    pub iterations_lod_factor: u32,
    /// Inner NNF passes at the finest level; level `i` runs
    /// `min_nnf_iterations + nnf_iterations_lod_factor * i`.
    pub min_nnf_iterations: u32,
    pub nnf_iterations_lod_factor: u32,
    /// Completeness weight of the bidirectional objective.
    pub alpha: f32,
    pub patch: PatchParams,
    /// Worker threads for the wavefront pass; 0 picks the rayon pool size.
    pub threads: usize,
    /// When set, per-level snapshots and offset fields are written here.
    pub debug_dir: Option<PathBuf>,
}

impl Default for RemovalParams {
    fn default() -> Self {
        RemovalParams {
            lod_bias: 0,
            min_iterations: 2,
            iterations_lod_factor: 2,
            min_nnf_iterations: 2,
            nnf_iterations_lod_factor: 1,
            alpha: 0.5,
            patch: PatchParams::default(),
            threads: 0,
            debug_dir: None,
        }
    }
}

/// Intermediate-result hook: `(partial, levels_done, levels_total)`.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(&RgbaImage, usize, usize);

/// Fill the region marked by `hole_mask` (bright = remove) with content
/// synthesized from the rest of `image`.
pub fn remove_object(
    image: &RgbaImage,
    hole_mask: &GrayImage,
    params: &RemovalParams,
    mut progress: Option<ProgressCallback<'_>>,
) -> Result<RgbaImage, String> {
    if image.dimensions() != hole_mask.dimensions() {
        return Err(format!(
            "mask is {}×{} but image is {}×{}",
            hole_mask.width(),
            hole_mask.height(),
            image.width(),
            image.height()
        ));
    }
    let threads = if params.threads == 0 {
        rayon::current_num_threads()
    } else {
        params.threads
    };
    let half = params.patch.half();

    let lab = rgba_to_lab(image);
    let importance = importance_from_hole_mask(hole_mask);

    // Matching levels for image and mask; the floor keeps the coarsest
    // level big enough for a few patches.
    let min_dim = params.patch.patch_size * 2;
    let images = GaussianPyramid::new(lab, 8, min_dim);
    let masks = GaussianPyramid::new(importance, images.len(), min_dim);
    debug_assert_eq!(images.len(), masks.len());

    let start_level = (images.len() - 1).saturating_sub(params.lod_bias);
    let total_levels = start_level + 1;
    let debug = DebugSink::new(params.debug_dir.clone());
    log_info!(
        "object removal: {}×{}, {} pyramid levels, starting at LOD {}",
        image.width(),
        image.height(),
        images.len(),
        start_level
    );

    let mut synthesized: Option<SynthesisState> = None;
    for level in (0..=start_level).rev() {
        let source = images.level(level).clone();
        let mask = masks.level(level).clone();
        let (w, h) = (source.width(), source.height());

        // Target: pristine source outside the hole, warm-started synthesis
        // inside it.
        let mut target = source.clone();
        if let Some(prev) = &synthesized {
            let upscaled = scale_up(&prev.target, w, h);
            impose_hole(&mut target, &upscaled, &mask);
        }

        if debug.is_enabled() {
            let gray = mask_to_gray(&mask);
            debug.write_image(
                &format!("lod_{}_mask", level),
                &image::DynamicImage::ImageLuma8(gray).to_rgba8(),
            );
        }

        let mut bds = BidirectionalSimilarity::new(source, target, params.patch)
            .map_err(|e| e.to_string())?;
        bds.source_mask = Some(mask.clone());
        bds.alpha = params.alpha;
        bds.nnf_iterations =
            params.min_nnf_iterations + params.nnf_iterations_lod_factor * level as u32;
        if debug.is_enabled() {
            bds.debug_path = params
                .debug_dir
                .as_ref()
                .map(|d| d.join(format!("lod_{}", level)));
        }
        if let Some(prev) = synthesized.take() {
            let s2t = upscale_field(&prev.s2t, w, h, w, h, half).map_err(|e| e.to_string())?;
            let t2s = upscale_field(&prev.t2s, w, h, w, h, half).map_err(|e| e.to_string())?;
            bds.warm_start(s2t, t2s);
        }

        let outer = params.min_iterations + params.iterations_lod_factor * level as u32;
        log_info!(
            "LOD {}: {}×{}, {} outer × {} NNF iterations",
            level,
            w,
            h,
            outer,
            bds.nnf_iterations
        );
        for _ in 0..outer {
            bds.iteration(threads).map_err(|e| e.to_string())?;
        }

        let partial = lab_to_rgba(&bds.target);
        debug.write_image(&format!("lod_{}_result", level), &partial);
        if let Some(cb) = progress.as_mut() {
            cb(&partial, start_level - level + 1, total_levels);
        }

        synthesized = Some(SynthesisState {
            target: bds.target.clone(),
            s2t: bds
                .source_to_target()
                .expect("iteration always leaves fields behind")
                .clone(),
            t2s: bds
                .target_to_source()
                .expect("iteration always leaves fields behind")
                .clone(),
        });
    }

    // Only hole pixels take the synthesized (and color-roundtripped) values;
    // everything else is byte-identical to the input.
    let state = synthesized.expect("at least one level always runs");
    let full = lab_to_rgba(&state.target);
    let mut out = image.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if hole_mask.get_pixel(x, y).0[0] >= 128 {
            *pixel = *full.get_pixel(x, y);
        }
    }
    Ok(out)
}

struct SynthesisState {
    target: Image<LabF32>,
    s2t: crate::field::OffsetField,
    t2s: crate::field::OffsetField,
}

/// Replace masked pixels of `target` with pixels of `filled`.
fn impose_hole(target: &mut Image<LabF32>, filled: &Image<LabF32>, mask: &Image<Alpha8>) {
    for y in 0..target.height() {
        for x in 0..target.width() {
            if mask.pixel(x, y).is_masked() {
                target.set_pixel(x, y, filled.pixel(x, y));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn untouched_outside_the_hole() {
        let mut img = RgbaImage::new(64, 64);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = image::Rgba([((x * 3) % 256) as u8, ((y * 5) % 256) as u8, 90, 255]);
        }
        let mut mask = GrayImage::new(64, 64);
        for y in 24..36 {
            for x in 24..36 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let params = RemovalParams {
            min_iterations: 1,
            iterations_lod_factor: 0,
            min_nnf_iterations: 1,
            nnf_iterations_lod_factor: 0,
            threads: 1,
            ..RemovalParams::default()
        };
        let out = remove_object(&img, &mask, &params, None).unwrap();
        for (x, y, p) in out.enumerate_pixels() {
            if mask.get_pixel(x, y).0[0] < 128 {
                assert_eq!(p, img.get_pixel(x, y), "pixel ({}, {}) modified", x, y);
            }
        }
    }

    #[test]
    fn flat_background_fills_flat() {
        // A gray canvas with a bright square marked for removal must come
        // back (almost) uniformly gray.
        let gray = image::Rgba([120u8, 120, 120, 255]);
        let mut img = RgbaImage::from_pixel(64, 64, gray);
        let mut mask = GrayImage::new(64, 64);
        for y in 28..40 {
            for x in 28..40 {
                img.put_pixel(x, y, image::Rgba([240, 240, 30, 255]));
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let params = RemovalParams {
            threads: 1,
            ..RemovalParams::default()
        };
        let out = remove_object(&img, &mask, &params, None).unwrap();
        for (x, y, p) in out.enumerate_pixels() {
            assert!(
                (p.0[0] as i32 - 120).abs() <= 6
                    && (p.0[1] as i32 - 120).abs() <= 6
                    && (p.0[2] as i32 - 120).abs() <= 6,
                "pixel ({}, {}) not filled with background: {:?}",
                x,
                y,
                p
            );
        }
    }

    #[test]
    fn rejects_mismatched_mask() {
        let img = RgbaImage::new(32, 32);
        let mask = GrayImage::new(16, 16);
        assert!(remove_object(&img, &mask, &RemovalParams::default(), None).is_err());
    }

    #[test]
    fn progress_callback_sees_every_level() {
        let img = RgbaImage::from_pixel(64, 64, image::Rgba([50, 60, 70, 255]));
        let mut mask = GrayImage::new(64, 64);
        for y in 30..34 {
            for x in 30..34 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let params = RemovalParams {
            min_iterations: 1,
            iterations_lod_factor: 0,
            min_nnf_iterations: 1,
            nnf_iterations_lod_factor: 0,
            threads: 1,
            ..RemovalParams::default()
        };
        let mut seen = Vec::new();
        let mut cb = |_: &RgbaImage, done: usize, total: usize| seen.push((done, total));
        remove_object(&img, &mask, &params, Some(&mut cb)).unwrap();
        assert!(!seen.is_empty());
        let total = seen[0].1;
        assert_eq!(seen.len(), total);
        assert_eq!(seen.last().unwrap().0, total);
    }
}
