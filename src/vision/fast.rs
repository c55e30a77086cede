//! FAST corner detection on the segment-test ring of 16 pixels.

use rayon::prelude::*;

use super::Plane;

/// Detected corner with its detector response.
#[derive(Debug, Clone, Copy)]
pub struct Corner {
    pub x: f64,
    pub y: f64,
    pub response: f32,
}

/// Ring offsets of the 16-pixel Bresenham circle of radius 3.
const ROW_OFFSETS: [isize; 16] = [0, 1, 2, 3, 3, 3, 2, 1, 0, -1, -2, -3, -3, -3, -2, -1];
const COLUMN_OFFSETS: [isize; 16] = [3, 3, 2, 1, 0, -1, -2, -3, -3, -3, -2, -1, 0, 1, 2, 3];

/// Minimum contiguous arc length for a segment-test corner.
const ARC_LENGTH: usize = 9;

const PIXEL_SIMILAR: u8 = 0;
const PIXEL_BRIGHTER: u8 = 1;
const PIXEL_DARKER: u8 = 2;

/// Detect FAST corners with non-maximum suppression.
///
/// `mask` is an optional per-pixel admission map of the same size as the
/// image; zero entries are skipped. The returned corners are unordered.
pub fn detect(image: &Plane, threshold: f32, mask: Option<&[u8]>) -> Vec<Corner> {
    let width = image.width;
    let height = image.height;
    if width < 7 || height < 7 {
        return Vec::new();
    }

    let src = &image.data;
    let mut response = vec![0.0f32; width * height];

    response[3 * width..(height - 3) * width]
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row_idx, row)| {
            let y = row_idx + 3;
            let mut bins = [PIXEL_SIMILAR; 16];
            let mut ring = [0.0f32; 16];

            for x in 3..width - 3 {
                if let Some(mask) = mask {
                    if mask[y * width + x] == 0 {
                        continue;
                    }
                }

                let center = src[y * width + x];
                let lower = center - threshold;
                let upper = center + threshold;

                // Speed test on four compass points.
                let mut brighter = 0;
                let mut darker = 0;
                for &k in &[0usize, 4, 8, 12] {
                    let idx = ((y as isize + ROW_OFFSETS[k]) * width as isize
                        + (x as isize + COLUMN_OFFSETS[k])) as usize;
                    let v = src[idx];
                    if v > upper {
                        brighter += 1;
                    } else if v < lower {
                        darker += 1;
                    }
                }
                if brighter < 3 && darker < 3 {
                    continue;
                }

                for k in 0..16 {
                    let idx = ((y as isize + ROW_OFFSETS[k]) * width as isize
                        + (x as isize + COLUMN_OFFSETS[k])) as usize;
                    let v = src[idx];
                    ring[k] = v;
                    bins[k] = if v > upper {
                        PIXEL_BRIGHTER
                    } else if v < lower {
                        PIXEL_DARKER
                    } else {
                        PIXEL_SIMILAR
                    };
                }

                let mut score = arc_response(center, &ring, &bins, PIXEL_BRIGHTER);
                if score == 0.0 {
                    score = arc_response(center, &ring, &bins, PIXEL_DARKER);
                }
                row[x] = score;
            }
        });

    // 3×3 non-maximum suppression; among equal responses the first pixel in
    // scan order wins.
    let mut corners = Vec::new();
    for y in 3..height - 3 {
        for x in 3..width - 3 {
            let score = response[y * width + x];
            if score <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let ny = (y as isize + dy) as usize;
                    let nx = (x as isize + dx) as usize;
                    let other = response[ny * width + nx];
                    let earlier = (ny, nx) < (y, x);
                    if other > score || (other == score && earlier) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                corners.push(Corner {
                    x: x as f64,
                    y: y as f64,
                    response: score,
                });
            }
        }
    }

    corners
}

/// Response of the longest qualifying arc: the summed absolute contrast of
/// the full ring, or zero if no contiguous arc reaches [`ARC_LENGTH`].
fn arc_response(center: f32, ring: &[f32; 16], bins: &[u8; 16], state: u8) -> f32 {
    let mut consecutive = 0;
    for l in 0..(16 + ARC_LENGTH - 1) {
        if bins[l % 16] == state {
            consecutive += 1;
            if consecutive >= ARC_LENGTH {
                return ring.iter().map(|&v| (v - center).abs()).sum();
            }
        } else {
            consecutive = 0;
        }
    }
    0.0
}
