//! Uniform-grid broad phase for circle-circle collision candidate pairs.
//!
//! The grid buckets point positions into fixed-size cells and enumerates
//! every unordered pair of points whose cells fall within a 3x3
//! neighborhood, each pair exactly once. Enumeration order is row-major
//! over the cell array, which makes the candidate stream deterministic for
//! a given rebuild.

use thiserror::Error;

/// Errors emitted by the grid.
#[derive(Debug, Error)]
pub enum GridError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Forward half of the 3x3 stencil: neighbors whose (row, col) is
/// lexicographically greater than the home cell. Visiting only these
/// produces each cross-cell pair once without a dedup set.
const FORWARD_STENCIL: [(i64, i64); 4] = [(0, 1), (1, -1), (1, 0), (1, 1)];

/// Uniform grid over a clamped rectangular arena.
///
/// Unlike a toroidal hash grid, out-of-range coordinates are clamped onto
/// the boundary cells rather than wrapped; callers keep their points inside
/// the arena, the clamp only absorbs boundary-exact floats.
#[derive(Debug, Clone)]
pub struct UniformGrid {
    cell_size: f32,
    inv_cell_size: f32,
    cols: usize,
    rows: usize,
    cells: Vec<Vec<usize>>,
    occupied: Vec<usize>,
    point_count: usize,
}

impl UniformGrid {
    /// Create a grid covering `width x height` with square cells of `cell_size`.
    pub fn new(cell_size: f32, width: f32, height: f32) -> Result<Self, GridError> {
        if !(cell_size > 0.0) {
            return Err(GridError::InvalidConfig("cell_size must be positive"));
        }
        if !(width > 0.0) || !(height > 0.0) {
            return Err(GridError::InvalidConfig("grid dimensions must be positive"));
        }
        if cell_size > width.min(height) {
            return Err(GridError::InvalidConfig(
                "cell_size must not exceed the smaller grid dimension",
            ));
        }
        let cols = Self::cells_for_dimension(width, cell_size);
        let rows = Self::cells_for_dimension(height, cell_size);
        Ok(Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cols,
            rows,
            cells: vec![Vec::new(); rows * cols],
            occupied: Vec::new(),
            point_count: 0,
        })
    }

    /// Edge length of one cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Grid extent as (rows, cols).
    #[must_use]
    pub const fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of cells holding at least one point after the last rebuild.
    #[must_use]
    pub fn occupied_cells(&self) -> usize {
        self.occupied.len()
    }

    /// Number of points inserted by the last rebuild.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.point_count
    }

    /// Returns true when the last rebuild inserted no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    /// Cell coordinates for a point, clamped into the grid.
    #[must_use]
    pub fn cell_of(&self, x: f32, y: f32) -> (usize, usize) {
        (
            Self::discretize(y * self.inv_cell_size, self.rows),
            Self::discretize(x * self.inv_cell_size, self.cols),
        )
    }

    /// Clear prior contents in place and bucket each position by its cell.
    ///
    /// Indices handed back by pair enumeration are indices into `positions`.
    pub fn rebuild(&mut self, positions: &[(f32, f32)]) {
        for &lin in &self.occupied {
            self.cells[lin].clear();
        }
        self.occupied.clear();
        self.point_count = positions.len();

        for (idx, &(x, y)) in positions.iter().enumerate() {
            let (row, col) = self.cell_of(x, y);
            let lin = row * self.cols + col;
            if self.cells[lin].is_empty() {
                self.occupied.push(lin);
            }
            self.cells[lin].push(idx);
        }
        // Row-major cell order keeps the candidate stream deterministic
        // regardless of insertion order.
        self.occupied.sort_unstable();
    }

    /// Visit every unordered candidate pair exactly once.
    ///
    /// Pairs are emitted per occupied cell in row-major order: first the
    /// intra-cell i<j combinations, then all cross pairs against the
    /// forward half of the 3x3 stencil.
    pub fn for_each_candidate_pair(&self, visit: &mut dyn FnMut(usize, usize)) {
        for &lin in &self.occupied {
            let bucket = &self.cells[lin];
            let row = lin / self.cols;
            let col = lin % self.cols;

            for i in 0..bucket.len() {
                for j in (i + 1)..bucket.len() {
                    visit(bucket[i], bucket[j]);
                }
            }

            for (dr, dc) in FORWARD_STENCIL {
                let nr = row as i64 + dr;
                let nc = col as i64 + dc;
                if nr < 0 || nr >= self.rows as i64 || nc < 0 || nc >= self.cols as i64 {
                    continue;
                }
                let other = &self.cells[nr as usize * self.cols + nc as usize];
                if other.is_empty() {
                    continue;
                }
                for &a in bucket {
                    for &b in other {
                        visit(a, b);
                    }
                }
            }
        }
    }

    /// Collect candidate pairs normalized to `(low, high)` index order.
    pub fn candidate_pairs(&self, out: &mut Vec<(usize, usize)>) {
        out.clear();
        self.for_each_candidate_pair(&mut |a, b| {
            out.push(if a < b { (a, b) } else { (b, a) });
        });
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn cells_for_dimension(dimension: f32, cell_size: f32) -> usize {
        (dimension / cell_size).ceil().max(1.0) as usize
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn discretize(scaled: f32, limit: usize) -> usize {
        let cell = scaled.floor();
        if cell <= 0.0 {
            0
        } else {
            (cell as usize).min(limit - 1)
        }
    }
}
