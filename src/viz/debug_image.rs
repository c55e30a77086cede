//! Side-by-side debug rendering of the tracked feature set.
//!
//! Tracked features are drawn in green with their temporal motion, newly
//! added features in yellow, grid lines in blue. Rendering only happens when
//! a debug subscriber exists.

use std::collections::HashMap;

use image::{Rgb, RgbImage};
use nalgebra::Point2;

use crate::system::messages::StereoFrame;
use crate::tracking::{FeatureId, GridFeatures};

const TRACKED: Rgb<u8> = Rgb([0, 255, 0]);
const NEW_FEATURE: Rgb<u8> = Rgb([255, 255, 0]);
const GRID_LINE: Rgb<u8> = Rgb([0, 0, 255]);

/// Render both cameras side by side with the current feature set.
pub fn draw_features_stereo(
    frame: &StereoFrame,
    prev_features: &GridFeatures,
    curr_features: &GridFeatures,
    grid_row: usize,
    grid_col: usize,
) -> RgbImage {
    let width = frame.cam0.width();
    let height = frame.cam0.height();
    let mut out = RgbImage::new(width * 2, height);

    for (x, y, pixel) in frame.cam0.enumerate_pixels() {
        let v = pixel.0[0];
        out.put_pixel(x, y, Rgb([v, v, v]));
    }
    for (x, y, pixel) in frame.cam1.enumerate_pixels() {
        let v = pixel.0[0];
        out.put_pixel(x + width, y, Rgb([v, v, v]));
    }

    let cell_height = height as f64 / grid_row as f64;
    let cell_width = width as f64 / grid_col as f64;
    for i in 1..grid_row {
        let y = (i as f64 * cell_height) as i64;
        draw_line(&mut out, (0, y), (2 * width as i64 - 1, y), GRID_LINE);
    }
    for i in 1..grid_col {
        let x = (i as f64 * cell_width) as i64;
        draw_line(&mut out, (x, 0), (x, height as i64 - 1), GRID_LINE);
        let x = x + width as i64;
        draw_line(&mut out, (x, 0), (x, height as i64 - 1), GRID_LINE);
    }

    let mut prev_cam0: HashMap<FeatureId, Point2<f64>> = HashMap::new();
    let mut prev_cam1: HashMap<FeatureId, Point2<f64>> = HashMap::new();
    for feature in prev_features.features() {
        prev_cam0.insert(feature.id, feature.cam0_point);
        prev_cam1.insert(feature.id, feature.cam1_point);
    }

    for feature in curr_features.features() {
        let curr0 = (feature.cam0_point.x as i64, feature.cam0_point.y as i64);
        let curr1 = (
            feature.cam1_point.x as i64 + width as i64,
            feature.cam1_point.y as i64,
        );
        if let (Some(p0), Some(p1)) = (prev_cam0.get(&feature.id), prev_cam1.get(&feature.id)) {
            let prev0 = (p0.x as i64, p0.y as i64);
            let prev1 = (p1.x as i64 + width as i64, p1.y as i64);
            draw_circle(&mut out, curr0, 3, TRACKED);
            draw_circle(&mut out, curr1, 3, TRACKED);
            draw_line(&mut out, prev0, curr0, TRACKED);
            draw_line(&mut out, prev1, curr1, TRACKED);
        } else {
            draw_circle(&mut out, curr0, 3, NEW_FEATURE);
            draw_circle(&mut out, curr1, 3, NEW_FEATURE);
        }
    }

    out
}

fn put_pixel_safe(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham line.
fn draw_line(image: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_pixel_safe(image, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Midpoint circle outline.
fn draw_circle(image: &mut RgbImage, center: (i64, i64), radius: i64, color: Rgb<u8>) {
    let (cx, cy) = center;
    let mut x = radius;
    let mut y = 0i64;
    let mut err = 1 - radius;

    while x >= y {
        for (px, py) in [
            (cx + x, cy + y),
            (cx - x, cy + y),
            (cx + x, cy - y),
            (cx - x, cy - y),
            (cx + y, cy + x),
            (cx - y, cy + x),
            (cx + y, cy - x),
            (cx - y, cy - x),
        ] {
            put_pixel_safe(image, px, py, color);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}
