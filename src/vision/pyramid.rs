//! Gaussian image pyramids with precomputed spatial gradients.
//!
//! Each camera gets one pyramid per frame; the tracker keeps the previous
//! left pyramid alive for temporal tracking and swaps it out at the frame
//! boundary.

use image::GrayImage;

use super::Plane;

/// 5-tap binomial kernel used for the downsampling blur.
const KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
const KERNEL_NORM: f32 = 16.0;

/// Image pyramid plus Scharr gradients of every level.
#[derive(Debug, Clone)]
pub struct Pyramid {
    /// Level 0 is the full-resolution image; each level halves the previous.
    pub levels: Vec<Plane>,
    pub grad_x: Vec<Plane>,
    pub grad_y: Vec<Plane>,
}

impl Pyramid {
    /// Build `pyramid_levels + 1` levels from an 8-bit image.
    pub fn build(image: &GrayImage, pyramid_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(pyramid_levels + 1);
        levels.push(Plane::from_gray(image));
        for l in 1..=pyramid_levels {
            levels.push(pyrdown(&levels[l - 1]));
        }

        let mut grad_x = Vec::with_capacity(levels.len());
        let mut grad_y = Vec::with_capacity(levels.len());
        for level in &levels {
            let (gx, gy) = scharr_gradients(level);
            grad_x.push(gx);
            grad_y.push(gy);
        }

        Self {
            levels,
            grad_x,
            grad_y,
        }
    }

    /// Full-resolution level.
    pub fn base(&self) -> &Plane {
        &self.levels[0]
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

/// Reflect an index into `[0, n)` without repeating the border sample
/// (BORDER_REFLECT_101).
#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * n - 2 - i;
    }
    i as usize
}

/// Blur with the binomial kernel and keep even rows/columns.
fn pyrdown(src: &Plane) -> Plane {
    let dst_width = src.width.div_ceil(2);
    let dst_height = src.height.div_ceil(2);

    // Horizontal pass over source rows.
    let mut blurred = vec![0.0f32; dst_width * src.height];
    for y in 0..src.height {
        let row = &src.data[y * src.width..(y + 1) * src.width];
        for dx in 0..dst_width {
            let cx = 2 * dx as isize;
            let mut acc = 0.0;
            for (k, w) in KERNEL.iter().enumerate() {
                acc += w * row[reflect(cx + k as isize - 2, src.width)];
            }
            blurred[y * dst_width + dx] = acc / KERNEL_NORM;
        }
    }

    // Vertical pass over the half-width intermediate.
    let mut dst = Plane::new(dst_width, dst_height);
    for dy in 0..dst_height {
        let cy = 2 * dy as isize;
        for dx in 0..dst_width {
            let mut acc = 0.0;
            for (k, w) in KERNEL.iter().enumerate() {
                acc += w * blurred[reflect(cy + k as isize - 2, src.height) * dst_width + dx];
            }
            dst.data[dy * dst_width + dx] = acc / KERNEL_NORM;
        }
    }

    dst
}

/// 3×3 Scharr derivatives, normalized by 32.
fn scharr_gradients(src: &Plane) -> (Plane, Plane) {
    let mut gx = Plane::new(src.width, src.height);
    let mut gy = Plane::new(src.width, src.height);

    for y in 0..src.height {
        let ym = reflect(y as isize - 1, src.height);
        let yp = reflect(y as isize + 1, src.height);
        for x in 0..src.width {
            let xm = reflect(x as isize - 1, src.width);
            let xp = reflect(x as isize + 1, src.width);

            let a = src.get(xm, ym);
            let b = src.get(x, ym);
            let c = src.get(xp, ym);
            let d = src.get(xm, y);
            let f = src.get(xp, y);
            let g = src.get(xm, yp);
            let h = src.get(x, yp);
            let i = src.get(xp, yp);

            gx.data[y * src.width + x] = (3.0 * (c - a) + 10.0 * (f - d) + 3.0 * (i - g)) / 32.0;
            gy.data[y * src.width + x] = (3.0 * (g - a) + 10.0 * (h - b) + 3.0 * (i - c)) / 32.0;
        }
    }

    (gx, gy)
}
