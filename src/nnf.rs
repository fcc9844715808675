// ============================================================================
// Nearest-neighbor field engine — PatchMatch propagation + random search
// ============================================================================
//
// The engine owns a source image, a target image, the offset field mapping
// every target patch center to its current best source patch center, and a
// distance cache holding the last known patch distance per target pixel.
// The field and cache are logically one record: they are always written
// together, and a reader never observes them in disagreement.
//
// One `iteration()` is a full raster scan alternating direct (top-left to
// bottom-right) and reverse order.  Each pixel first tries to adopt the
// offsets of its two already-visited scan neighbors (propagation), then
// samples displacements from an exponentially shrinking window around its
// current offset (random search).  There is no convergence check; the
// caller owns the iteration budget.

use crate::buffer::{Image, ImageError};
use crate::field::{Lcg, OffsetField, make_random_field, make_smooth_field};
use crate::geometry::{Offset, Rect};
use crate::pixel::{Alpha8, PixelOps};
use crate::superpatch::SuperPatchGrid;

/// Window shrink factor per random-search round.
pub const RANDOM_SEARCH_INV_ALPHA: i32 = 2;

/// Search tunables shared by the engine and the schedulers built on it.
#[derive(Clone, Copy, Debug)]
pub struct PatchParams {
    /// Patch window side; odd, at least 3.
    pub patch_size: i32,
    /// Superpatch tiles are squares of `super_patch_factor * patch_size`.
    pub super_patch_factor: i32,
    /// Hard cap on random-search rounds per pixel.
    pub random_search_limit: u32,
    /// Seed for every PRNG the engine creates.
    pub seed: u64,
}

impl Default for PatchParams {
    fn default() -> Self {
        PatchParams {
            patch_size: 7,
            super_patch_factor: 4,
            random_search_limit: 32,
            seed: 0,
        }
    }
}

impl PatchParams {
    #[inline]
    pub fn half(&self) -> i32 {
        self.patch_size / 2
    }

    #[inline]
    pub fn super_patch_size(&self) -> i32 {
        self.super_patch_factor * self.patch_size
    }

    fn validate(&self) {
        assert!(
            self.patch_size >= 3 && self.patch_size % 2 == 1,
            "patch size must be odd and >= 3, got {}",
            self.patch_size
        );
        assert!(self.super_patch_factor >= 1);
    }
}

/// Worst-case distance between two patches, for thresholding against.
pub fn patch_distance_upper_bound<P: PixelOps>(patch_size: i32) -> f64 {
    P::dist_to_f64(P::distance_upper_bound()) * (patch_size as f64) * (patch_size as f64)
}

/// Last known patch distance for one target pixel.  `valid` is false until
/// the warm-up pass (or a lazy load) has established the true distance.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheEntry<D> {
    pub dist: D,
    pub valid: bool,
}

pub struct NnfEngine<P: PixelOps> {
    source: Image<P>,
    target: Image<P>,
    source_mask: Option<Image<Alpha8>>,
    field: OffsetField,
    cache: Image<CacheEntry<P::Dist>>,
    params: PatchParams,
    iteration: u32,
    max_radius: i32,
    search_rng: Lcg,
    source_rect: Rect,
    target_rect: Rect,
    // Shrunk one further pixel: inside these the incremental distance path
    // never needs mirrored access, even for the columns sliding in and out.
    source_inner: Rect,
    target_inner: Rect,
    tiles: SuperPatchGrid,
}

impl<P: PixelOps> NnfEngine<P> {
    pub fn new(source: Image<P>, target: Image<P>, params: PatchParams) -> Result<Self, ImageError> {
        params.validate();
        let half = params.half();
        for img in [(source.width(), source.height()), (target.width(), target.height())] {
            if img.0 < params.patch_size || img.1 < params.patch_size {
                return Err(ImageError::TooSmall {
                    width: img.0,
                    height: img.1,
                    patch_size: params.patch_size,
                });
            }
        }
        let source_rect = Rect::patch_centers(source.width(), source.height(), half);
        let target_rect = Rect::patch_centers(target.width(), target.height(), half);
        let field = OffsetField::new(target.width(), target.height())?;
        let cache = Image::new(target.width(), target.height())?;
        let max_radius = source.width().max(source.height());
        let tiles =
            SuperPatchGrid::new(target.width(), target.height(), params.super_patch_size());
        Ok(NnfEngine {
            source,
            target,
            source_mask: None,
            field,
            cache,
            params,
            iteration: 0,
            max_radius,
            search_rng: Lcg::new(params.seed),
            source_rect,
            target_rect,
            source_inner: source_rect.shrunk(1),
            target_inner: target_rect.shrunk(1),
            tiles,
        })
    }

    /// Exclude masked source pixels from ever being matched.  The mask must
    /// have the source dimensions.
    pub fn set_source_mask(&mut self, mask: Option<Image<Alpha8>>) {
        if let Some(m) = &mask {
            debug_assert!(m.same_dimensions(&self.source));
        }
        self.source_mask = mask;
    }

    pub fn params(&self) -> &PatchParams {
        &self.params
    }

    pub fn source(&self) -> &Image<P> {
        &self.source
    }

    pub fn target(&self) -> &Image<P> {
        &self.target
    }

    pub fn field(&self) -> &OffsetField {
        &self.field
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    pub fn source_rect(&self) -> Rect {
        self.source_rect
    }

    pub fn target_rect(&self) -> Rect {
        self.target_rect
    }

    // ---- initialization ----------------------------------------------------

    /// Assign every target pixel a uniformly random valid source patch
    /// center, reset the search PRNG to the configured seed, and warm the
    /// distance cache.  Same seed ⇒ same fill, independent of thread count.
    pub fn random_fill(&mut self) {
        let half = self.params.half();
        let mut rng = Lcg::new(self.params.seed);
        let (sw, sh) = (self.source.width(), self.source.height());
        for y in 0..self.field.height() {
            for x in 0..self.field.width() {
                let sx = rng.uniform(half, sw - half);
                let sy = rng.uniform(half, sh - half);
                self.field.set_pixel(x, y, Offset::between(x, y, sx, sy));
            }
        }
        self.after_fill();
    }

    /// Deterministic linear mapping `source = target * source_size /
    /// target_size`; seeds coherent structure on nearly-aligned images.
    pub fn smooth_fill(&mut self) {
        let (sw, sh) = (self.source.width(), self.source.height());
        let (tw, th) = (self.target.width(), self.target.height());
        let half = self.params.half();
        for y in 0..th {
            for x in 0..tw {
                let sx = (x * sw / tw).clamp(half, sw - half - 1);
                let sy = (y * sh / th).clamp(half, sh - half - 1);
                self.field.set_pixel(x, y, Offset::between(x, y, sx, sy));
            }
        }
        self.after_fill();
    }

    /// Install an externally built field (warm start from a previous run or
    /// an upscaled coarser level).  Offsets are clamped to the valid source
    /// patch-center rect, then the cache is rebuilt.
    pub fn install_field(&mut self, field: OffsetField) -> Result<(), ImageError> {
        if !field.same_dimensions(&self.target) {
            return Err(ImageError::BadDimensions {
                width: field.width(),
                height: field.height(),
            });
        }
        self.field = field;
        crate::field::clamp_field(
            &mut self.field,
            self.source.width(),
            self.source.height(),
            self.params.half(),
        );
        // clamp_field leaves the border band untouched; force it valid too.
        let half = self.params.half();
        let (sw, sh) = (self.source.width(), self.source.height());
        for y in 0..self.field.height() {
            for x in 0..self.field.width() {
                if self.target_rect.contains(x, y) {
                    continue;
                }
                let (sx, sy) = self.field.pixel(x, y).apply(x, y);
                let cx = sx.clamp(half, sw - half - 1);
                let cy = sy.clamp(half, sh - half - 1);
                self.field.set_pixel(x, y, Offset::between(x, y, cx, cy));
            }
        }
        self.after_fill();
        Ok(())
    }

    /// Reset iteration state and rebuild the whole distance cache with full
    /// (never early-terminated) recomputation.  Incremental updates during
    /// propagation assume the cache holds true distances, so this pass is
    /// mandatory after any fill.
    fn after_fill(&mut self) {
        self.iteration = 0;
        self.search_rng = Lcg::new(self.params.seed);
        self.warm_cache();
    }

    fn warm_cache(&mut self) {
        use rayon::prelude::*;
        let (w, h) = (self.target.width(), self.target.height());
        let ctx = ScanView {
            source: &self.source,
            target: &self.target,
            source_rect: self.source_rect,
            target_rect: self.target_rect,
            half: self.params.half(),
        };
        let field = &self.field;
        let rows: Vec<Vec<CacheEntry<P::Dist>>> = (0..h)
            .into_par_iter()
            .map(|y| {
                let mut row = Vec::with_capacity(w as usize);
                for x in 0..w {
                    let (sx, sy) = field.pixel(x, y).apply(x, y);
                    row.push(CacheEntry {
                        dist: ctx.patch_distance_full(x, y, sx, sy),
                        valid: true,
                    });
                }
                row
            })
            .collect();
        let cache = self.cache.pixels_mut();
        for (y, row) in rows.into_iter().enumerate() {
            let base = y * w as usize;
            cache[base..base + w as usize].copy_from_slice(&row);
        }
    }

    // ---- iteration ---------------------------------------------------------

    /// One full-image refinement pass on the calling thread.  Odd passes run
    /// in direct scan order, even passes in reverse.
    pub fn iteration(&mut self) {
        self.iteration += 1;
        let direct = self.iteration % 2 == 1;
        let (w, h) = (self.target.width(), self.target.height());
        let mut rng = std::mem::replace(&mut self.search_rng, Lcg::new(0));
        let ctx = self.scan_ctx();
        // Sequential pass: this thread owns the whole field.
        unsafe { ctx.scan_rect(0, 0, w, h, direct, &mut rng) };
        self.search_rng = rng;
    }

    /// One full-image refinement pass distributed over `threads` workers via
    /// the superpatch wavefront scheduler.
    pub fn iteration_parallel(&mut self, threads: usize) {
        crate::superpatch::iterate_wavefront(self, threads);
    }

    pub(crate) fn advance_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    /// Tile layout and raw scan view for the wavefront scheduler.
    pub(crate) fn wavefront_parts(&mut self) -> (&SuperPatchGrid, ScanCtx<'_, P>) {
        let field_ptr = self.field.pixels_mut().as_mut_ptr();
        let cache_ptr = self.cache.pixels_mut().as_mut_ptr();
        let ctx = ScanCtx {
            view: ScanView {
                source: &self.source,
                target: &self.target,
                source_rect: self.source_rect,
                target_rect: self.target_rect,
                half: self.params.half(),
            },
            mask: self.source_mask.as_ref(),
            field: field_ptr,
            cache: cache_ptr,
            field_width: self.target.width(),
            source_inner: self.source_inner,
            target_inner: self.target_inner,
            max_radius: self.max_radius,
            search_limit: self.params.random_search_limit,
        };
        (&self.tiles, ctx)
    }

    /// Raw view for scan passes.  The caller upholds the aliasing contract
    /// documented on [`ScanCtx`].
    pub(crate) fn scan_ctx(&mut self) -> ScanCtx<'_, P> {
        let field_ptr = self.field.pixels_mut().as_mut_ptr();
        let cache_ptr = self.cache.pixels_mut().as_mut_ptr();
        ScanCtx {
            view: ScanView {
                source: &self.source,
                target: &self.target,
                source_rect: self.source_rect,
                target_rect: self.target_rect,
                half: self.params.half(),
            },
            mask: self.source_mask.as_ref(),
            field: field_ptr,
            cache: cache_ptr,
            field_width: self.target.width(),
            source_inner: self.source_inner,
            target_inner: self.target_inner,
            max_radius: self.max_radius,
            search_limit: self.params.random_search_limit,
        }
    }

    // ---- inspection --------------------------------------------------------

    /// Summed cached patch distance over the whole target.  With a fixed
    /// seed and single-threaded execution this never increases between
    /// iterations.
    pub fn total_distance(&self) -> f64 {
        self.cache
            .pixels()
            .iter()
            .map(|c| P::dist_to_f64(c.dist))
            .sum()
    }

    /// Cached patch distance at one target pixel (warm after any fill).
    pub fn cached_distance(&self, x: i32, y: i32) -> P::Dist {
        let entry = self.cache.pixel(x, y);
        debug_assert!(entry.valid, "cache read before warm-up at ({}, {})", x, y);
        entry.dist
    }

    /// Recompute the patch distance from scratch for every `stride`-th pixel
    /// and count cache entries that disagree.  Test hook for the
    /// field/cache consistency invariant.
    pub fn verify_cache(&self, stride: i32) -> usize {
        let ctx = ScanView {
            source: &self.source,
            target: &self.target,
            source_rect: self.source_rect,
            target_rect: self.target_rect,
            half: self.params.half(),
        };
        let mut mismatches = 0;
        let mut y = 0;
        while y < self.target.height() {
            let mut x = 0;
            while x < self.target.width() {
                let (sx, sy) = self.field.pixel(x, y).apply(x, y);
                let truth = ctx.patch_distance_full(x, y, sx, sy);
                let cached = self.cache.pixel(x, y);
                if !cached.valid || dist_differs::<P>(truth, cached.dist) {
                    mismatches += 1;
                }
                x += stride;
            }
            y += stride;
        }
        mismatches
    }
}

fn dist_differs<P: PixelOps>(a: P::Dist, b: P::Dist) -> bool {
    let (fa, fb) = (P::dist_to_f64(a), P::dist_to_f64(b));
    let scale = fa.abs().max(fb.abs()).max(1.0);
    (fa - fb).abs() > scale * 1e-4
}

// ============================================================================
// Distance computation
// ============================================================================

/// Read-only inputs to patch-distance evaluation.
#[derive(Clone, Copy)]
pub(crate) struct ScanView<'a, P: PixelOps> {
    pub source: &'a Image<P>,
    pub target: &'a Image<P>,
    pub source_rect: Rect,
    pub target_rect: Rect,
    pub half: i32,
}

impl<'a, P: PixelOps> ScanView<'a, P> {
    #[inline]
    fn read<const MIRROR: bool>(img: &Image<P>, x: i32, y: i32) -> P {
        if MIRROR {
            img.pixel_mirrored(x, y)
        } else {
            img.pixel(x, y)
        }
    }

    /// Full window sum, no early exit.  Used by the cache warm-up and the
    /// consistency checker.
    pub fn patch_distance_full(&self, tx: i32, ty: i32, sx: i32, sy: i32) -> P::Dist {
        self.dispatch::<false>(tx, ty, sx, sy, P::Dist::default())
    }

    /// Window sum that aborts at the end of a row once the running total
    /// exceeds `known`.  Only for comparisons against an existing best —
    /// the warm-up must see the exact total.
    pub fn patch_distance_early(
        &self,
        tx: i32,
        ty: i32,
        sx: i32,
        sy: i32,
        known: P::Dist,
    ) -> P::Dist {
        self.dispatch::<true>(tx, ty, sx, sy, known)
    }

    /// Select the boundary-handling variant: patches whose center lies
    /// outside the safe rect get mirrored access on that side.
    #[inline]
    fn dispatch<const EARLY: bool>(
        &self,
        tx: i32,
        ty: i32,
        sx: i32,
        sy: i32,
        known: P::Dist,
    ) -> P::Dist {
        let sm = !self.source_rect.contains(sx, sy);
        let tm = !self.target_rect.contains(tx, ty);
        match (sm, tm) {
            (false, false) => self.window::<EARLY, false, false>(tx, ty, sx, sy, known),
            (false, true) => self.window::<EARLY, false, true>(tx, ty, sx, sy, known),
            (true, false) => self.window::<EARLY, true, false>(tx, ty, sx, sy, known),
            (true, true) => self.window::<EARLY, true, true>(tx, ty, sx, sy, known),
        }
    }

    fn window<const EARLY: bool, const SM: bool, const TM: bool>(
        &self,
        tx: i32,
        ty: i32,
        sx: i32,
        sy: i32,
        known: P::Dist,
    ) -> P::Dist {
        let half = self.half;
        let mut total = P::Dist::default();
        for dy in -half..=half {
            for dx in -half..=half {
                let s = Self::read::<SM>(self.source, sx + dx, sy + dy);
                let t = Self::read::<TM>(self.target, tx + dx, ty + dy);
                total += P::distance(s, t);
            }
            // Outer loop only: one comparison per row.
            if EARLY && total > known {
                return total;
            }
        }
        total
    }

    /// One column of the window (for horizontal slides).
    #[inline]
    fn column_sum(&self, tx: i32, ty: i32, sx: i32, sy: i32) -> P::Dist {
        let mut total = P::Dist::default();
        for dy in -self.half..=self.half {
            total += P::distance(self.source.pixel(sx, sy + dy), self.target.pixel(tx, ty + dy));
        }
        total
    }

    /// One row of the window (for vertical slides).
    #[inline]
    fn row_sum(&self, tx: i32, ty: i32, sx: i32, sy: i32) -> P::Dist {
        let mut total = P::Dist::default();
        for dx in -self.half..=self.half {
            total += P::distance(self.source.pixel(sx + dx, sy), self.target.pixel(tx + dx, ty));
        }
        total
    }
}

// ============================================================================
// Scan pass
// ============================================================================

/// Mutable scan state over the offset field and distance cache.
///
/// The field and cache are accessed through raw pointers so that the
/// superpatch scheduler can run disjoint tiles from several threads without
/// per-pixel locking.  Safety contract, upheld by both callers:
///
/// * a pixel is written by at most one thread during a pass (tiles are
///   disjoint and each is owned by exactly one worker);
/// * the one-pixel halo a tile reads (its scan-predecessor neighbors) is
///   only read after the owning tile has been fully processed, with the
///   queue mutex providing the happens-before edge (wavefront ordering).
pub(crate) struct ScanCtx<'a, P: PixelOps> {
    pub view: ScanView<'a, P>,
    pub mask: Option<&'a Image<Alpha8>>,
    field: *mut Offset,
    cache: *mut CacheEntry<P::Dist>,
    field_width: i32,
    source_inner: Rect,
    target_inner: Rect,
    max_radius: i32,
    search_limit: u32,
}

unsafe impl<'a, P: PixelOps> Send for ScanCtx<'a, P> {}
unsafe impl<'a, P: PixelOps> Sync for ScanCtx<'a, P> {}

impl<'a, P: PixelOps> ScanCtx<'a, P> {
    #[inline]
    fn idx(&self, x: i32, y: i32) -> usize {
        (y as usize) * (self.field_width as usize) + (x as usize)
    }

    #[inline]
    unsafe fn offset_at(&self, x: i32, y: i32) -> Offset {
        unsafe { *self.field.add(self.idx(x, y)) }
    }

    /// Field and cache are one record: always stored together.
    #[inline]
    unsafe fn store(&self, x: i32, y: i32, offset: Offset, dist: P::Dist) {
        let i = self.idx(x, y);
        unsafe {
            *self.field.add(i) = offset;
            *self.cache.add(i) = CacheEntry { dist, valid: true };
        }
    }

    #[inline]
    unsafe fn load_distance(&self, x: i32, y: i32) -> P::Dist {
        let i = self.idx(x, y);
        let entry = unsafe { *self.cache.add(i) };
        if entry.valid {
            entry.dist
        } else {
            let offset = unsafe { self.offset_at(x, y) };
            let (sx, sy) = offset.apply(x, y);
            let dist = self.view.patch_distance_full(x, y, sx, sy);
            unsafe { *self.cache.add(i) = CacheEntry { dist, valid: true } };
            dist
        }
    }

    #[inline]
    fn candidate_allowed(&self, sx: i32, sy: i32) -> bool {
        if !self.view.source_rect.contains(sx, sy) {
            return false;
        }
        match self.mask {
            Some(mask) => !mask.pixel(sx, sy).is_masked(),
            None => true,
        }
    }

    /// Run the sequential scan algorithm over the rectangle
    /// `[left, right) × [top, bottom)`.
    ///
    /// The scan-region borders that coincide with the image border are
    /// special: the first scanned row/column has only one neighbor
    /// direction, and the starting corner has none (random search only).
    /// Borders interior to the image propagate from the adjacent,
    /// already-processed region outside the rectangle.
    ///
    /// # Safety
    /// See the aliasing contract on [`ScanCtx`].
    pub(crate) unsafe fn scan_rect(
        &self,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        direct: bool,
        rng: &mut Lcg,
    ) {
        unsafe {
            if direct {
                self.scan_direct(left, top, right, bottom, rng);
            } else {
                self.scan_reverse(left, top, right, bottom, rng);
            }
        }
    }

    unsafe fn scan_direct(&self, left: i32, top: i32, right: i32, bottom: i32, rng: &mut Lcg) {
        unsafe {
            // The image's top-left pixel has nowhere to propagate from.
            if left == 0 && top == 0 {
                self.random_search(0, 0, rng);
            }
            let start_x = if left == 0 { 1 } else { left };
            let start_y = if top == 0 { 1 } else { top };

            // Top image row: only horizontal propagation.
            if top == 0 {
                for x in start_x..right {
                    self.propagate(x, 0, -1, true, false);
                    self.random_search(x, 0, rng);
                }
            }
            // Left image column: only vertical propagation.
            if left == 0 {
                for y in start_y..bottom {
                    self.propagate(0, y, -1, false, true);
                    self.random_search(0, y, rng);
                }
            }
            for y in start_y..bottom {
                for x in start_x..right {
                    self.propagate(x, y, -1, true, true);
                    self.random_search(x, y, rng);
                }
            }
        }
    }

    unsafe fn scan_reverse(&self, left: i32, top: i32, right: i32, bottom: i32, rng: &mut Lcg) {
        unsafe {
            let (w, h) = (self.view.target.width(), self.view.target.height());
            if right == w && bottom == h {
                self.random_search(right - 1, bottom - 1, rng);
            }
            let start_x = if right == w { right - 2 } else { right - 1 };
            let start_y = if bottom == h { bottom - 2 } else { bottom - 1 };

            if bottom == h {
                let mut x = start_x;
                while x >= left {
                    self.propagate(x, bottom - 1, 1, true, false);
                    self.random_search(x, bottom - 1, rng);
                    x -= 1;
                }
            }
            if right == w {
                let mut y = start_y;
                while y >= top {
                    self.propagate(right - 1, y, 1, false, true);
                    self.random_search(right - 1, y, rng);
                    y -= 1;
                }
            }
            let mut y = start_y;
            while y >= top {
                let mut x = start_x;
                while x >= left {
                    self.propagate(x, y, 1, true, true);
                    self.random_search(x, y, rng);
                    x -= 1;
                }
                y -= 1;
            }
        }
    }

    /// Try to adopt the offsets of the horizontal and/or vertical scan
    /// neighbor at `(x + dir, y)` / `(x, y + dir)`.
    unsafe fn propagate(&self, x: i32, y: i32, dir: i32, horizontal: bool, vertical: bool) {
        unsafe {
            let mut best_offset = self.offset_at(x, y);
            let mut best = self.load_distance(x, y);
            let mut changed = false;

            if horizontal {
                let candidate = self.offset_at(x + dir, y);
                let (sx, sy) = candidate.apply(x, y);
                if self.candidate_allowed(sx, sy) {
                    let d = self.slide_distance(x, y, x + dir, y, sx, sy, best, true);
                    if d < best {
                        best = d;
                        best_offset = candidate;
                        changed = true;
                    }
                }
            }
            if vertical {
                let candidate = self.offset_at(x, y + dir);
                let (sx, sy) = candidate.apply(x, y);
                if self.candidate_allowed(sx, sy) {
                    let d = self.slide_distance(x, y, x, y + dir, sx, sy, best, false);
                    if d < best {
                        best = d;
                        best_offset = candidate;
                        changed = true;
                    }
                }
            }
            if changed {
                self.store(x, y, best_offset, best);
            }
        }
    }

    /// Distance the pixel `(tx, ty)` would get by adopting the offset of its
    /// neighbor `(nx, ny)`.
    ///
    /// When the neighbor's distance is cached and both patch windows sit in
    /// the one-pixel-shrunk interior rects, the result is derived from the
    /// neighbor's cached value by exchanging the window column (or row) that
    /// slides out for the one that slides in — O(patch) instead of
    /// O(patch²).  Every other case recomputes in full with mirroring.
    unsafe fn slide_distance(
        &self,
        tx: i32,
        ty: i32,
        nx: i32,
        ny: i32,
        sx: i32,
        sy: i32,
        known: P::Dist,
        horizontal: bool,
    ) -> P::Dist {
        let view = &self.view;
        let half = view.half;
        let interior = self.target_inner.contains(tx, ty) && self.source_inner.contains(sx, sy);
        if interior {
            let i = self.idx(nx, ny);
            let neighbor_cache = unsafe { *self.cache.add(i) };
            if neighbor_cache.valid {
                // Movement from neighbor to this pixel.
                if horizontal {
                    let m = tx - nx; // ±1
                    let leaving = view.column_sum(tx - m * (half + 1), ty, sx - m * (half + 1), sy);
                    let entering = view.column_sum(tx + m * half, ty, sx + m * half, sy);
                    return neighbor_cache.dist - leaving + entering;
                } else {
                    let m = ty - ny;
                    let leaving = view.row_sum(tx, ty - m * (half + 1), sx, sy - m * (half + 1));
                    let entering = view.row_sum(tx, ty + m * half, sx, sy + m * half);
                    return neighbor_cache.dist - leaving + entering;
                }
            }
        }
        view.patch_distance_early(tx, ty, sx, sy, known)
    }

    /// Sample displacements around the current offset from a window that
    /// halves each round, accepting strictly better candidates.  The window
    /// stays centered on the offset held at entry (local sampling policy).
    /// Stops when the window collapses below one pixel, the round cap is
    /// reached, or the best distance hits zero (perfect match).
    unsafe fn random_search(&self, x: i32, y: i32, rng: &mut Lcg) {
        unsafe {
            let center = self.offset_at(x, y).apply(x, y);
            let mut best_offset = self.offset_at(x, y);
            let mut best = self.load_distance(x, y);
            if P::is_zero(best) {
                return;
            }
            let mut changed = false;
            let mut radius = self.max_radius;
            let mut rounds = 0;

            while radius >= 1 && rounds < self.search_limit {
                let wx = rng.uniform(-radius, radius + 1);
                let wy = rng.uniform(-radius, radius + 1);
                let (sx, sy) = (center.0 + wx, center.1 + wy);
                if self.candidate_allowed(sx, sy) {
                    let d = self.view.patch_distance_early(x, y, sx, sy, best);
                    if d < best {
                        best = d;
                        best_offset = Offset::between(x, y, sx, sy);
                        changed = true;
                        if P::is_zero(best) {
                            break;
                        }
                    }
                }
                radius /= RANDOM_SEARCH_INV_ALPHA;
                rounds += 1;
            }
            if changed {
                self.store(x, y, best_offset, best);
            }
        }
    }
}

// ============================================================================
// Convenience constructors
// ============================================================================

impl<P: PixelOps> NnfEngine<P> {
    /// Engine pre-filled with a random field (the common entry point).
    pub fn with_random_fill(
        source: Image<P>,
        target: Image<P>,
        params: PatchParams,
    ) -> Result<Self, ImageError> {
        let mut engine = Self::new(source, target, params)?;
        engine.random_fill();
        Ok(engine)
    }

    /// Standalone random field matching this engine's geometry, for callers
    /// that want to repair a field before installing it.
    pub fn make_field(&self) -> Result<OffsetField, ImageError> {
        make_random_field(
            self.target.width(),
            self.target.height(),
            self.source.width(),
            self.source.height(),
            self.params.half(),
            self.params.seed,
        )
    }

    /// Standalone smooth field matching this engine's geometry.
    pub fn make_smooth(&self) -> Result<OffsetField, ImageError> {
        make_smooth_field(
            self.target.width(),
            self.target.height(),
            self.source.width(),
            self.source.height(),
            self.params.half(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn assert_field_valid(engine: &NnfEngine<Rgb8>) {
        let rect = engine.source_rect();
        let field = engine.field();
        for y in 0..field.height() {
            for x in 0..field.width() {
                let (sx, sy) = field.pixel(x, y).apply(x, y);
                assert!(
                    rect.contains(sx, sy),
                    "offset at ({}, {}) points to invalid source center ({}, {})",
                    x,
                    y,
                    sx,
                    sy
                );
            }
        }
    }

    #[test]
    fn rejects_images_smaller_than_a_patch() {
        let small = noise_image(5, 5, 1);
        let ok = noise_image(32, 32, 2);
        let err = NnfEngine::new(small, ok, PatchParams::default());
        assert!(matches!(err, Err(ImageError::TooSmall { .. })));
    }

    #[test]
    fn offsets_stay_valid_across_iterations() {
        let source = noise_image(48, 40, 1);
        let target = noise_image(40, 48, 2);
        let mut engine = NnfEngine::with_random_fill(source, target, PatchParams::default()).unwrap();
        assert_field_valid(&engine);
        for _ in 0..3 {
            engine.iteration();
            assert_field_valid(&engine);
        }
    }

    #[test]
    fn total_distance_is_monotonically_non_increasing() {
        let source = noise_image(48, 48, 3);
        let target = noise_image(48, 48, 4);
        let mut engine = NnfEngine::with_random_fill(source, target, PatchParams::default()).unwrap();
        let mut prev = engine.total_distance();
        for _ in 0..4 {
            engine.iteration();
            let now = engine.total_distance();
            assert!(
                now <= prev + 1e-6,
                "distance went up: {} -> {}",
                prev,
                now
            );
            prev = now;
        }
    }

    #[test]
    fn single_threaded_runs_are_bit_identical() {
        let source = noise_image(40, 40, 5);
        let target = noise_image(40, 40, 6);
        let run = |iters: usize| {
            let mut engine =
                NnfEngine::with_random_fill(source.clone(), target.clone(), PatchParams::default())
                    .unwrap();
            for _ in 0..iters {
                engine.iteration();
            }
            engine.field().pixels().to_vec()
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn cache_matches_full_recomputation_after_iterations() {
        let source = noise_image(48, 40, 7);
        let target = noise_image(40, 40, 8);
        let mut engine = NnfEngine::with_random_fill(source, target, PatchParams::default()).unwrap();
        assert_eq!(engine.verify_cache(1), 0);
        for _ in 0..3 {
            engine.iteration();
            assert_eq!(engine.verify_cache(1), 0, "cache drifted from field");
        }
    }

    #[test]
    fn self_match_finds_zero_distance() {
        // Matching an image against itself: for interior pixels the smooth
        // fill is the identity map and already perfect, and iterations must
        // not disturb a zero-distance match.
        let img = noise_image(32, 32, 9);
        let mut engine = NnfEngine::new(img.clone(), img, PatchParams::default()).unwrap();
        engine.smooth_fill();
        let rect = engine.target_rect();
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                assert_eq!(engine.field().pixel(x, y), Offset::ZERO);
                assert_eq!(engine.cached_distance(x, y), 0);
            }
        }
        engine.iteration();
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                assert_eq!(engine.cached_distance(x, y), 0);
            }
        }
    }

    #[test]
    fn masked_source_is_never_matched() {
        use crate::pixel::Alpha8;
        let source = noise_image(40, 40, 10);
        let target = noise_image(40, 40, 11);
        // Mask out the right half of the source.
        let mask = Image::from_fn(40, 40, |x, _| {
            if x >= 20 { Alpha8::new(0) } else { Alpha8::OPAQUE }
        })
        .unwrap();
        let mut engine = NnfEngine::new(source, target, PatchParams::default()).unwrap();
        engine.set_source_mask(Some(mask.clone()));
        let mut field = engine.make_field().unwrap();
        crate::field::remove_masked_offsets(&mut field, &mask, 3, 40, 0);
        engine.install_field(field).unwrap();
        for _ in 0..2 {
            engine.iteration();
        }
        let rect = engine.target_rect();
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                let (sx, sy) = engine.field().pixel(x, y).apply(x, y);
                assert!(
                    !mask.pixel(sx, sy).is_masked(),
                    "iteration moved ({}, {}) into the masked region",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn incremental_slide_equals_full_recomputation() {
        // Interior pixels: the O(patch) delta update must agree exactly with
        // the O(patch²) recomputation (integer distances, no rounding).
        let source = noise_image(64, 64, 12);
        let target = noise_image(64, 64, 13);
        let mut engine =
            NnfEngine::with_random_fill(source.clone(), target.clone(), PatchParams::default())
                .unwrap();
        let view = ScanView {
            source: &source,
            target: &target,
            source_rect: engine.source_rect(),
            target_rect: engine.target_rect(),
            half: engine.params().half(),
        };
        let source_rect = engine.source_rect();
        let target_inner = engine.target_rect().shrunk(1);
        let source_inner = source_rect.shrunk(1);
        let field = engine.field().clone();
        let ctx = engine.scan_ctx();
        let mut checked = 0;
        for y in target_inner.top..target_inner.bottom {
            for x in target_inner.left..target_inner.right {
                for (nx, ny, horizontal) in [(x - 1, y, true), (x + 1, y, true), (x, y - 1, false), (x, y + 1, false)] {
                    let offset = field.pixel(nx, ny);
                    let (sx, sy) = offset.apply(x, y);
                    if !source_inner.contains(sx, sy) {
                        continue;
                    }
                    let incremental =
                        unsafe { ctx.slide_distance(x, y, nx, ny, sx, sy, u32::MAX, horizontal) };
                    let full = view.patch_distance_full(x, y, sx, sy);
                    assert_eq!(incremental, full, "slide mismatch at ({}, {})", x, y);
                    checked += 1;
                }
            }
        }
        assert!(checked > 1000, "too few interior cases exercised: {}", checked);
    }
}
