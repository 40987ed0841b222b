//! Local slice of the grid: the owned rows `[lb, ub)` plus one halo row on
//! each side, stored row-major in one contiguous buffer.

use super::partition::Partition;
use std::ops::Range;

/// Fixed value of row 0.
pub const TOP: f64 = 4.56;
/// Fixed value of row `N-1`.
pub const BOTTOM: f64 = 9.85;
/// Fixed value of column 0.
pub const LEFT: f64 = 7.32;
/// Fixed value of column `N-1`.
pub const RIGHT: f64 = 6.88;

/// Checkerboard colour of a cell: red cells have an odd `row + col`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    Red,
    Black,
}

impl Color {
    pub const BOTH: [Color; 2] = [Color::Red, Color::Black];

    fn parity(self) -> usize {
        match self {
            Color::Red => 0,
            Color::Black => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GridStore {
    n: usize,
    lb: usize,
    ub: usize,
    /// Global index of the first stored row (`lb - 1`).
    first: usize,
    cells: Vec<f64>,
}

impl GridStore {
    /// Allocate rows `lb-1 ..= ub` for `part`, zero-filled.
    pub fn new(part: &Partition) -> Self {
        let first = part.lb - 1;
        let stored = part.ub - first + 1;
        Self {
            n: part.n,
            lb: part.lb,
            ub: part.ub,
            first,
            cells: vec![0.0; stored * part.n],
        }
    }

    /// Fixed boundary values on rows/columns `0` and `N-1`, zero elsewhere.
    /// Halo rows are covered too, so a fresh slice needs no exchange to be
    /// consistent with its neighbours.
    pub fn initialize(&mut self) {
        let n = self.n;
        for i in self.stored_rows() {
            let base = self.offset(i);
            for (j, cell) in self.cells[base..base + n].iter_mut().enumerate() {
                *cell = if i == 0 {
                    TOP
                } else if i == n - 1 {
                    BOTTOM
                } else if j == 0 {
                    LEFT
                } else if j == n - 1 {
                    RIGHT
                } else {
                    0.0
                };
            }
        }
    }

    pub fn ncol(&self) -> usize {
        self.n
    }
    pub fn lb(&self) -> usize {
        self.lb
    }
    pub fn ub(&self) -> usize {
        self.ub
    }
    pub fn owned_rows(&self) -> Range<usize> {
        self.lb..self.ub
    }
    /// Owned rows plus both halo rows.
    pub fn stored_rows(&self) -> Range<usize> {
        self.first..self.ub + 1
    }

    #[inline]
    fn offset(&self, row: usize) -> usize {
        debug_assert!(
            self.stored_rows().contains(&row),
            "row {row} outside {:?}",
            self.stored_rows()
        );
        (row - self.first) * self.n
    }

    /// # Panics
    /// If `row` is neither owned nor a halo row.
    pub fn row(&self, row: usize) -> &[f64] {
        let base = self.offset(row);
        &self.cells[base..base + self.n]
    }

    /// # Panics
    /// If `row` is neither owned nor a halo row.
    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        let base = self.offset(row);
        &mut self.cells[base..base + self.n]
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.row(row)[col]
    }

    pub fn set(&mut self, row: usize, col: usize, v: f64) {
        self.row_mut(row)[col] = v;
    }

    pub fn stencil(&self, row: usize, col: usize) -> f64 {
        let k = self.offset(row) + col;
        let (c, n) = (&self.cells, self.n);
        (c[k - n] + c[k + n] + c[k - 1] + c[k + 1]) / 4.0
    }

    /// Over-relax every interior cell of `color` in `rows` and return the
    /// largest unrelaxed change. Cells of one colour only read cells of the
    /// other, so the row order within `rows` does not affect the result.
    pub fn sweep(&mut self, color: Color, rows: Range<usize>, omega: f64) -> f64 {
        debug_assert!(rows.is_empty() || (rows.start >= self.lb && rows.end <= self.ub));
        let n = self.n;
        let mut maxdiff = 0.0f64;
        for i in rows {
            let base = self.offset(i);
            let d = (i + color.parity()) & 1;
            for j in (1 + d..n - 1).step_by(2) {
                let g_new = self.stencil(i, j);
                let old = self.cells[base + j];
                let diff = (g_new - old).abs();
                if diff > maxdiff {
                    maxdiff = diff;
                }
                self.cells[base + j] = old + omega * (g_new - old);
            }
        }
        maxdiff
    }
}
