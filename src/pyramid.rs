// ============================================================================
// Gaussian pyramid — box downsample / bilinear upsample
// ============================================================================
//
// Coarse-to-fine synthesis runs the expensive iterations on small images
// first.  The kernels here go through the same accumulator abstraction the
// voting pass uses, so they work for any core pixel type.

use crate::buffer::Image;
use crate::pixel::{PixelAccumulator, PixelOps};

/// Halve both dimensions with a 2×2 box filter (edge rows/columns clamp).
pub fn scale_down<P: PixelOps>(src: &Image<P>) -> Image<P> {
    let w = (src.width() + 1) / 2;
    let h = (src.height() + 1) / 2;
    Image::from_fn(w.max(1), h.max(1), |x, y| {
        let mut acc = P::Acc::default();
        for dy in 0..2 {
            for dx in 0..2 {
                let sx = (x * 2 + dx).min(src.width() - 1);
                let sy = (y * 2 + dy).min(src.height() - 1);
                acc.append(src.pixel(sx, sy), 1.0);
            }
        }
        acc.resolve()
    })
    .expect("halved dimensions stay positive")
}

/// Resample to `w × h` with bilinear interpolation.
pub fn scale_up<P: PixelOps>(src: &Image<P>, w: i32, h: i32) -> Image<P> {
    assert!(w > 0 && h > 0);
    let sx_ratio = src.width() as f32 / w as f32;
    let sy_ratio = src.height() as f32 / h as f32;
    Image::from_fn(w, h, |x, y| {
        let fx = ((x as f32 + 0.5) * sx_ratio - 0.5).max(0.0);
        let fy = ((y as f32 + 0.5) * sy_ratio - 0.5).max(0.0);
        let x0 = fx.floor() as i32;
        let y0 = fy.floor() as i32;
        let x1 = (x0 + 1).min(src.width() - 1);
        let y1 = (y0 + 1).min(src.height() - 1);
        let tx = fx - x0 as f32;
        let ty = fy - y0 as f32;

        let mut acc = P::Acc::default();
        acc.append(src.pixel(x0, y0), (1.0 - tx) * (1.0 - ty));
        acc.append(src.pixel(x1, y0), tx * (1.0 - ty));
        acc.append(src.pixel(x0, y1), (1.0 - tx) * ty);
        acc.append(src.pixel(x1, y1), tx * ty);
        acc.resolve()
    })
    .expect("dimensions validated above")
}

/// Level 0 is the full-resolution image; each further level halves both
/// dimensions.
pub struct GaussianPyramid<P: PixelOps> {
    levels: Vec<Image<P>>,
}

impl<P: PixelOps> GaussianPyramid<P> {
    /// Build at most `max_levels` levels, stopping early once another halving
    /// would drop a dimension below `min_dimension`.
    pub fn new(image: Image<P>, max_levels: usize, min_dimension: i32) -> Self {
        let mut levels = vec![image];
        while levels.len() < max_levels {
            let last = levels.last().expect("pyramid never empty");
            if last.width() / 2 < min_dimension || last.height() / 2 < min_dimension {
                break;
            }
            levels.push(scale_down(last));
        }
        GaussianPyramid { levels }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, i: usize) -> &Image<P> {
        &self.levels[i]
    }

    pub fn coarsest(&self) -> &Image<P> {
        self.levels.last().expect("pyramid never empty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::Rgb8;

    #[test]
    fn scale_down_halves_dimensions() {
        let img = Image::<Rgb8>::new(9, 6).unwrap();
        let half = scale_down(&img);
        assert_eq!((half.width(), half.height()), (5, 3));
    }

    #[test]
    fn flat_image_survives_scaling() {
        let color = Rgb8::new(40, 90, 170);
        let img = Image::from_fn(16, 16, |_, _| color).unwrap();
        let down = scale_down(&img);
        let up = scale_up(&down, 16, 16);
        for y in 0..16 {
            for x in 0..16 {
                assert_eq!(up.pixel(x, y), color);
            }
        }
    }

    #[test]
    fn box_filter_averages() {
        let img = Image::from_fn(2, 2, |x, y| {
            Rgb8::new((x * 100) as u8, (y * 100) as u8, 0)
        })
        .unwrap();
        let down = scale_down(&img);
        assert_eq!(down.pixel(0, 0), Rgb8::new(50, 50, 0));
    }

    #[test]
    fn pyramid_respects_min_dimension() {
        let img = Image::<Rgb8>::new(64, 64).unwrap();
        let pyr = GaussianPyramid::new(img, 10, 16);
        // 64 -> 32 -> 16, then 8 would fall below the floor.
        assert_eq!(pyr.len(), 3);
        assert_eq!(pyr.coarsest().width(), 16);
    }
}
