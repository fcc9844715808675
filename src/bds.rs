// ============================================================================
// Bidirectional similarity — dual NNFs + voting synthesis
// ============================================================================
//
// Each outer iteration refines two opposing nearest-neighbor fields and
// blends them into a new target:
//
//   source→target ("completeness"): every source patch should be
//   represented somewhere in the target, so each source patch scatters
//   votes onto the target pixels its match covers;
//
//   target→source ("coherence"): every target patch should look like some
//   source patch, so each target patch gathers votes from its match.
//
// Votes are weighted running sums per target pixel; the normalized result
// replaces the target.  Masked source pixels never contribute, which is
// what keeps a removed object from reappearing.

use std::path::PathBuf;

use crate::buffer::{Image, ImageError};
use crate::field::{OffsetField, remove_masked_offsets};
use crate::geometry::Rect;
use crate::io::DebugSink;
use crate::nnf::{NnfEngine, PatchParams};
use crate::pixel::{Alpha8, PixelAccumulator, PixelOps};

pub struct BidirectionalSimilarity<P: PixelOps> {
    /// Source image; never modified.
    pub source: Image<P>,
    /// Importance mask over the source; masked pixels are excluded from
    /// matching and voting.
    pub source_mask: Option<Image<Alpha8>>,
    /// Target image and the result of the synthesis.
    pub target: Image<P>,
    /// Completeness/coherence balance in [0, 1]; the completeness vote
    /// weight is `alpha`, the coherence weight `1 - alpha`.
    pub alpha: f32,
    /// Inner NNF refinement passes per outer iteration.
    pub nnf_iterations: u32,
    /// When set, offset-field visualizations are written here per outer
    /// iteration.
    pub debug_path: Option<PathBuf>,

    params: PatchParams,
    source_to_target: Option<OffsetField>,
    target_to_source: Option<OffsetField>,
    iteration: u32,
}

impl<P: PixelOps> BidirectionalSimilarity<P> {
    pub fn new(
        source: Image<P>,
        target: Image<P>,
        params: PatchParams,
    ) -> Result<Self, ImageError> {
        for (w, h) in [(source.width(), source.height()), (target.width(), target.height())] {
            if w < params.patch_size || h < params.patch_size {
                return Err(ImageError::TooSmall {
                    width: w,
                    height: h,
                    patch_size: params.patch_size,
                });
            }
        }
        Ok(BidirectionalSimilarity {
            source,
            source_mask: None,
            target,
            alpha: 0.5,
            nnf_iterations: 5,
            debug_path: None,
            params,
            source_to_target: None,
            target_to_source: None,
            iteration: 0,
        })
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    pub fn params(&self) -> &PatchParams {
        &self.params
    }

    /// Current coherence field (target-indexed), once an iteration has run.
    pub fn target_to_source(&self) -> Option<&OffsetField> {
        self.target_to_source.as_ref()
    }

    /// Current completeness field (source-indexed).
    pub fn source_to_target(&self) -> Option<&OffsetField> {
        self.source_to_target.as_ref()
    }

    /// Install fields carried over from a coarser pyramid level.
    pub fn warm_start(&mut self, source_to_target: OffsetField, target_to_source: OffsetField) {
        self.source_to_target = Some(source_to_target);
        self.target_to_source = Some(target_to_source);
    }

    /// Forget both fields and the iteration counter so the next call to
    /// [`iteration`] re-initializes.  Public images are untouched.
    pub fn reset(&mut self) {
        self.source_to_target = None;
        self.target_to_source = None;
        self.iteration = 0;
    }

    /// One outer iteration: refine both NNFs, vote, and replace the target
    /// with the normalized accumulation.  `threads == 1` runs the
    /// single-threaded scan; more threads use the superpatch wavefront.
    pub fn iteration(&mut self, threads: usize) -> Result<(), ImageError> {
        let s2t = self.update_source_to_target(threads)?;
        let t2s = self.update_target_to_source(threads)?;

        self.vote(&s2t, &t2s);
        self.debug_output(&s2t, &t2s);

        self.source_to_target = Some(s2t);
        self.target_to_source = Some(t2s);
        self.iteration += 1;
        Ok(())
    }

    /// Completeness field: domain is the source, matches live in the target.
    fn update_source_to_target(&mut self, threads: usize) -> Result<OffsetField, ImageError> {
        let mut engine =
            NnfEngine::new(self.target.clone(), self.source.clone(), self.params)?;
        match self.source_to_target.take() {
            Some(field) => engine.install_field(field)?,
            None => engine.random_fill(),
        }
        run_passes(&mut engine, self.nnf_iterations, threads);
        Ok(engine.field().clone())
    }

    /// Coherence field: domain is the target, matches live in the source.
    /// The source mask both restricts candidates and repairs the initial
    /// fill.
    fn update_target_to_source(&mut self, threads: usize) -> Result<OffsetField, ImageError> {
        let mut engine =
            NnfEngine::new(self.source.clone(), self.target.clone(), self.params)?;
        engine.set_source_mask(self.source_mask.clone());
        match self.target_to_source.take() {
            Some(field) => engine.install_field(field)?,
            None => {
                engine.random_fill();
                if let Some(mask) = &self.source_mask {
                    let mut field = engine.field().clone();
                    remove_masked_offsets(
                        &mut field,
                        mask,
                        self.params.half(),
                        40,
                        self.params.seed,
                    );
                    engine.install_field(field)?;
                }
            }
        }
        run_passes(&mut engine, self.nnf_iterations, threads);
        Ok(engine.field().clone())
    }

    fn vote(&mut self, s2t: &OffsetField, t2s: &OffsetField) {
        let completeness = self.alpha;
        let coherency = 1.0 - self.alpha;
        let half = self.params.half();
        let (tw, th) = (self.target.width(), self.target.height());

        let mut votes: Image<P::Acc> = Image::new(tw, th).expect("target dims already validated");

        // Coherence: each target patch gathers from its matched source patch.
        let target_rect = Rect::patch_centers(tw, th, half);
        for qy in target_rect.top..target_rect.bottom {
            for qx in target_rect.left..target_rect.right {
                let (px, py) = t2s.pixel(qx, qy).apply(qx, qy);
                self.vote_patch(&mut votes, qx, qy, px, py, coherency);
            }
        }

        // Completeness: each source patch scatters onto its match in the
        // target.
        let source_rect =
            Rect::patch_centers(self.source.width(), self.source.height(), half);
        for py in source_rect.top..source_rect.bottom {
            for px in source_rect.left..source_rect.right {
                let (qx, qy) = s2t.pixel(px, py).apply(px, py);
                self.vote_patch(&mut votes, qx, qy, px, py, completeness);
            }
        }

        // Collect: normalized sum per pixel; unvoted pixels keep their value.
        for y in 0..th {
            for x in 0..tw {
                let acc = votes.pixel(x, y);
                if acc.norm() > 0.0 {
                    self.target.set_pixel(x, y, acc.resolve());
                }
            }
        }
    }

    /// One vote per window pixel: the source patch around `(px, py)` onto
    /// the target patch around `(qx, qy)`.  Masked source pixels stay
    /// silent.
    #[inline]
    fn vote_patch(
        &self,
        votes: &mut Image<P::Acc>,
        qx: i32,
        qy: i32,
        px: i32,
        py: i32,
        weight: f32,
    ) {
        let half = self.params.half();
        for dy in -half..=half {
            for dx in -half..=half {
                let (sx, sy) = (px + dx, py + dy);
                if let Some(mask) = &self.source_mask {
                    if mask.pixel(sx, sy).is_masked() {
                        continue;
                    }
                }
                votes
                    .pixel_mut(qx + dx, qy + dy)
                    .append(self.source.pixel(sx, sy), weight);
            }
        }
    }

    fn debug_output(&self, s2t: &OffsetField, t2s: &OffsetField) {
        let Some(path) = &self.debug_path else {
            return;
        };
        let sink = DebugSink::new(Some(path.clone()));
        sink.write_field(&format!("s2t_{:03}", self.iteration), s2t);
        sink.write_field(&format!("t2s_{:03}", self.iteration), t2s);
    }
}

fn run_passes<P: PixelOps>(engine: &mut NnfEngine<P>, passes: u32, threads: usize) {
    for _ in 0..passes {
        if threads <= 1 {
            engine.iteration();
        } else {
            engine.iteration_parallel(threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Lcg;
    use crate::pixel::Rgb8;

    fn noise_image(w: i32, h: i32, seed: u64) -> Image<Rgb8> {
        let mut rng = Lcg::new(seed);
        Image::from_fn(w, h, |_, _| {
            Rgb8::new(
                rng.uniform(0, 256) as u8,
                rng.uniform(0, 256) as u8,
                rng.uniform(0, 256) as u8,
            )
        })
        .unwrap()
    }

    #[test]
    fn identity_fields_leave_identical_images_fixed() {
        // Source == target with identity fields: every NNF match is already
        // perfect, iterations cannot disturb a zero-distance match, and all
        // votes carry the pixel's own value — the target must not change.
        let img = Image::from_fn(32, 32, |x, y| {
            let v = (((x * 7 + y * 13) % 32) * 8) as u8;
            Rgb8::new(v, 255 - v, 128)
        })
        .unwrap();
        let mut bds =
            BidirectionalSimilarity::new(img.clone(), img.clone(), PatchParams::default())
                .unwrap();
        bds.nnf_iterations = 2;
        let identity = crate::field::make_smooth_field(32, 32, 32, 32, 3).unwrap();
        bds.warm_start(identity.clone(), identity);
        bds.iteration(1).unwrap();
        for y in 0..32 {
            for x in 0..32 {
                assert_eq!(
                    bds.target.pixel(x, y),
                    img.pixel(x, y),
                    "target drifted at ({}, {})",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn masked_source_color_never_enters_target() {
        // Source carries a red square under the mask; the synthesized
        // target must contain no trace of it.
        let green = Rgb8::new(20, 200, 40);
        let red = Rgb8::new(230, 10, 10);
        let source = Image::from_fn(48, 48, |x, y| {
            if (16..32).contains(&x) && (16..32).contains(&y) {
                red
            } else {
                green
            }
        })
        .unwrap();
        let mask = Image::from_fn(48, 48, |x, y| {
            if (16..32).contains(&x) && (16..32).contains(&y) {
                Alpha8::new(0)
            } else {
                Alpha8::OPAQUE
            }
        })
        .unwrap();
        let mut bds =
            BidirectionalSimilarity::new(source.clone(), source.clone(), PatchParams::default())
                .unwrap();
        bds.source_mask = Some(mask);
        bds.nnf_iterations = 3;
        for _ in 0..2 {
            bds.iteration(1).unwrap();
        }
        for y in 0..48 {
            for x in 0..48 {
                let p = bds.target.pixel(x, y);
                assert!(
                    p.r < 128,
                    "masked red leaked into target at ({}, {}): {:?}",
                    x,
                    y,
                    p
                );
            }
        }
    }

    #[test]
    fn outer_iterations_advance_and_reset_rearms() {
        let source = noise_image(24, 24, 1);
        let target = noise_image(24, 24, 2);
        let mut bds = BidirectionalSimilarity::new(source, target, PatchParams::default()).unwrap();
        bds.nnf_iterations = 1;
        bds.iteration(1).unwrap();
        bds.iteration(1).unwrap();
        assert_eq!(bds.iteration_count(), 2);
        assert!(bds.source_to_target().is_some());
        assert!(bds.target_to_source().is_some());
        bds.reset();
        assert_eq!(bds.iteration_count(), 0);
        assert!(bds.source_to_target().is_none());
    }
}
