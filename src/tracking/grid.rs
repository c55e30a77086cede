//! Grid-binned feature store.
//!
//! The image plane is partitioned into `grid_row × grid_col` cells; each cell
//! holds the features currently anchored in it. Two stores exist at any time
//! (previous and current) and are rotated at the frame boundary.

use std::collections::BTreeMap;

use nalgebra::Point2;

/// Persistent feature identifier, assigned once at birth and never reused.
pub type FeatureId = u64;

/// Bookkeeping record of one tracked feature.
#[derive(Debug, Clone)]
pub struct FeatureMetaData {
    pub id: FeatureId,
    /// Number of frames this feature has survived the full pipeline.
    pub lifetime: usize,
    /// Detector strength at detection time; tie-break only.
    pub response: f32,
    /// Last accepted pixel position in the left camera.
    pub cam0_point: Point2<f64>,
    /// Last accepted pixel position in the right camera.
    pub cam1_point: Point2<f64>,
}

/// Ordered mapping from cell code to the features anchored in that cell.
#[derive(Debug, Clone)]
pub struct GridFeatures {
    grid_row: usize,
    grid_col: usize,
    cells: BTreeMap<usize, Vec<FeatureMetaData>>,
}

impl GridFeatures {
    /// A store with every cell present and empty.
    pub fn new(grid_row: usize, grid_col: usize) -> Self {
        let cells = (0..grid_row * grid_col).map(|code| (code, Vec::new())).collect();
        Self {
            grid_row,
            grid_col,
            cells,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.grid_row * self.grid_col
    }

    /// Append a feature to its cell. The caller computes `code` from the
    /// feature's left pixel at insertion time.
    pub fn insert(&mut self, code: usize, feature: FeatureMetaData) {
        self.cells.entry(code).or_default().push(feature);
    }

    pub fn cell(&self, code: usize) -> &[FeatureMetaData] {
        self.cells.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cells in ascending code order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, &Vec<FeatureMetaData>)> {
        self.cells.iter().map(|(code, features)| (*code, features))
    }

    /// All features, flattened in cell-code order.
    pub fn features(&self) -> impl Iterator<Item = &FeatureMetaData> {
        self.cells.values().flatten()
    }

    pub fn num_features(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    /// Truncate every over-full cell to `max_per_cell`, keeping the longest
    /// lived features (ties broken by response, then by id).
    pub fn prune_overflow(&mut self, max_per_cell: usize) {
        for features in self.cells.values_mut() {
            if features.len() <= max_per_cell {
                continue;
            }
            features.sort_by(|a, b| {
                b.lifetime
                    .cmp(&a.lifetime)
                    .then_with(|| b.response.total_cmp(&a.response))
                    .then_with(|| a.id.cmp(&b.id))
            });
            features.truncate(max_per_cell);
        }
    }

    /// Empty every cell, keeping the grid shape.
    pub fn reset(&mut self) {
        for features in self.cells.values_mut() {
            features.clear();
        }
    }
}

/// Cell code of a pixel given the per-frame cell extents. Border pixels bin
/// into the last row/column.
pub fn cell_code(
    pt: &Point2<f64>,
    cell_width: f64,
    cell_height: f64,
    grid_row: usize,
    grid_col: usize,
) -> usize {
    let row = ((pt.y / cell_height) as usize).min(grid_row - 1);
    let col = ((pt.x / cell_width) as usize).min(grid_col - 1);
    row * grid_col + col
}
