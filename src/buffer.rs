// ============================================================================
// 2-D image buffer — dense row-major storage with copy-on-write sharing
// ============================================================================

use std::sync::Arc;

/// Construction-time precondition failures.  Out-of-bounds access at runtime
/// is a programming error (debug assertion), not a recoverable condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// Zero-sized image requested.
    BadDimensions { width: i32, height: i32 },
    /// Image cannot contain a single full patch window.
    TooSmall {
        width: i32,
        height: i32,
        patch_size: i32,
    },
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::BadDimensions { width, height } => {
                write!(f, "invalid image dimensions {}×{}", width, height)
            }
            ImageError::TooSmall {
                width,
                height,
                patch_size,
            } => write!(
                f,
                "image {w}×{h} too small for a {p}×{p} patch window",
                w = width,
                h = height,
                p = patch_size
            ),
        }
    }
}

impl std::error::Error for ImageError {}

#[derive(Clone)]
struct ImageData<T> {
    width: i32,
    height: i32,
    pixels: Vec<T>,
}

/// Dense `width × height` pixel grid.
///
/// Value type with copy-on-write sharing: `clone()` only bumps a reference
/// count, and the first mutating access afterwards deep-copies via
/// `Arc::make_mut`.  Two clones therefore mutate independently, while
/// read-only copies stay cheap.
#[derive(Clone)]
pub struct Image<T> {
    data: Arc<ImageData<T>>,
}

impl<T: Copy + Default> Image<T> {
    /// Create a buffer filled with `T::default()`.
    pub fn new(width: i32, height: i32) -> Result<Self, ImageError> {
        if width <= 0 || height <= 0 {
            return Err(ImageError::BadDimensions { width, height });
        }
        Ok(Image {
            data: Arc::new(ImageData {
                width,
                height,
                pixels: vec![T::default(); (width as usize) * (height as usize)],
            }),
        })
    }
}

impl<T: Copy> Image<T> {
    /// Wrap an existing row-major pixel vector.  `pixels.len()` must equal
    /// `width * height`.
    pub fn from_vec(width: i32, height: i32, pixels: Vec<T>) -> Result<Self, ImageError> {
        if width <= 0 || height <= 0 || pixels.len() != (width as usize) * (height as usize) {
            return Err(ImageError::BadDimensions { width, height });
        }
        Ok(Image {
            data: Arc::new(ImageData {
                width,
                height,
                pixels,
            }),
        })
    }

    /// Build from a per-pixel closure, row by row.
    pub fn from_fn(
        width: i32,
        height: i32,
        mut f: impl FnMut(i32, i32) -> T,
    ) -> Result<Self, ImageError> {
        if width <= 0 || height <= 0 {
            return Err(ImageError::BadDimensions { width, height });
        }
        let mut pixels = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self::from_vec(width, height, pixels)
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.data.width
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.data.height
    }

    #[inline]
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.data.width && y >= 0 && y < self.data.height
    }

    #[inline]
    fn idx(&self, x: i32, y: i32) -> usize {
        (y as usize) * (self.data.width as usize) + (x as usize)
    }

    /// Unmirrored read.  Going out of bounds is a bug in the caller.
    #[inline]
    pub fn pixel(&self, x: i32, y: i32) -> T {
        debug_assert!(self.in_bounds(x, y), "pixel ({}, {}) out of bounds", x, y);
        self.data.pixels[self.idx(x, y)]
    }

    /// Checked read.
    #[inline]
    pub fn get(&self, x: i32, y: i32) -> Option<T> {
        if self.in_bounds(x, y) {
            Some(self.data.pixels[self.idx(x, y)])
        } else {
            None
        }
    }

    /// Boundary-safe read: out-of-range coordinates reflect back across the
    /// nearest edge without repeating it (`mirror(-1) == 1`,
    /// `mirror(n) == n - 2`).
    #[inline]
    pub fn pixel_mirrored(&self, x: i32, y: i32) -> T {
        let mx = mirror_coordinate(x, self.data.width);
        let my = mirror_coordinate(y, self.data.height);
        self.data.pixels[self.idx(mx, my)]
    }

    /// Mutable access; deep-copies first when the storage is shared.
    #[inline]
    pub fn pixel_mut(&mut self, x: i32, y: i32) -> &mut T {
        debug_assert!(self.in_bounds(x, y), "pixel ({}, {}) out of bounds", x, y);
        let i = self.idx(x, y);
        &mut Arc::make_mut(&mut self.data).pixels[i]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: i32, y: i32, value: T) {
        *self.pixel_mut(x, y) = value;
    }

    /// Row-major pixel slice.
    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.data.pixels
    }

    /// Mutable row-major slice; unshares first.
    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [T] {
        &mut Arc::make_mut(&mut self.data).pixels
    }

    pub fn fill(&mut self, value: T) {
        self.pixels_mut().fill(value);
    }

    /// True when no other `Image` shares this storage — mutation will happen
    /// in place rather than copy.
    pub fn is_uniquely_owned(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    pub fn same_dimensions<U: Copy>(&self, other: &Image<U>) -> bool {
        self.width() == other.width() && self.height() == other.height()
    }
}

/// Reflect a coordinate into `[0, n)` without repeating the edge pixel.
/// Applied repeatedly, so it is total for any input once `n >= 2`.
#[inline]
pub fn mirror_coordinate(mut c: i32, n: i32) -> i32 {
    debug_assert!(n > 0);
    if n == 1 {
        return 0;
    }
    loop {
        if c < 0 {
            c = -c;
        } else if c >= n {
            c = 2 * n - 2 - c;
        } else {
            return c;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            Image::<u8>::new(0, 10),
            Err(ImageError::BadDimensions { .. })
        ));
        assert!(matches!(
            Image::<u8>::new(10, -1),
            Err(ImageError::BadDimensions { .. })
        ));
    }

    #[test]
    fn clones_mutate_independently() {
        let mut a = Image::<u8>::new(4, 4).unwrap();
        a.set_pixel(1, 1, 7);
        let mut b = a.clone();
        assert!(!a.is_uniquely_owned());
        b.set_pixel(1, 1, 9);
        assert_eq!(a.pixel(1, 1), 7);
        assert_eq!(b.pixel(1, 1), 9);
        // Writing to b unshared both handles.
        assert!(a.is_uniquely_owned());
        assert!(b.is_uniquely_owned());
    }

    #[test]
    fn mirror_convention_single_reflection() {
        // mirror(-1) == 1 and mirror(n) == n - 2: reflect without repeating
        // the border pixel.
        assert_eq!(mirror_coordinate(-1, 8), 1);
        assert_eq!(mirror_coordinate(-2, 8), 2);
        assert_eq!(mirror_coordinate(8, 8), 6);
        assert_eq!(mirror_coordinate(9, 8), 5);
        assert_eq!(mirror_coordinate(0, 8), 0);
        assert_eq!(mirror_coordinate(7, 8), 7);
    }

    #[test]
    fn mirror_convention_far_out_of_range() {
        // Repeated reflection keeps the result in range even for coordinates
        // further out than one image width.
        assert_eq!(mirror_coordinate(-9, 8), 5);
        assert_eq!(mirror_coordinate(15, 8), 1);
        assert_eq!(mirror_coordinate(0, 1), 0);
        assert_eq!(mirror_coordinate(-5, 1), 0);
    }

    #[test]
    fn mirrored_access_all_edges_and_corners() {
        let img = Image::from_fn(4, 3, |x, y| (10 * y + x) as u8).unwrap();
        // Edges.
        assert_eq!(img.pixel_mirrored(-1, 0), img.pixel(1, 0));
        assert_eq!(img.pixel_mirrored(4, 1), img.pixel(2, 1));
        assert_eq!(img.pixel_mirrored(2, -1), img.pixel(2, 1));
        assert_eq!(img.pixel_mirrored(2, 3), img.pixel(2, 1));
        // Corners reflect both axes.
        assert_eq!(img.pixel_mirrored(-1, -1), img.pixel(1, 1));
        assert_eq!(img.pixel_mirrored(4, -1), img.pixel(2, 1));
        assert_eq!(img.pixel_mirrored(-1, 3), img.pixel(1, 1));
        assert_eq!(img.pixel_mirrored(4, 3), img.pixel(2, 1));
    }
}
