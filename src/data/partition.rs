//! Row decomposition of the grid and the analytic SOR parameters.
//!
//! Rows `0` and `N-1` are fixed boundaries. The `N-1` rows `[0, N-1)` are split
//! evenly over `P` ranks, the first `(N-1) mod P` ranks taking one extra row;
//! rank 0's lower bound is then bumped from 0 to 1.

use crate::sor_error::SorError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::ops::Range;

/// Termination tolerance before scaling by the relaxation factor.
pub const TOLERANCE: f64 = 0.00001;

/// Damping applied to the optimal relaxation factor.
pub const OMEGA_DAMPING: f64 = 0.8;

/// The half-open row range `[lb, ub)` owned by one rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub n: usize,
    pub ranks: usize,
    pub rank: usize,
    pub lb: usize,
    pub ub: usize,
}

impl Partition {
    /// Bounds of `rank` in an `n`×`n` grid shared by `ranks` ranks.
    ///
    /// # Errors
    /// `ProblemTooSmall` when there are fewer interior rows than ranks, which
    /// would leave some rank without a row to compute.
    pub fn compute(n: usize, ranks: usize, rank: usize) -> Result<Self, SorError> {
        if ranks == 0 || rank >= ranks {
            return Err(SorError::Configuration(format!(
                "rank {rank} outside pool of {ranks}"
            )));
        }
        let interior = n.saturating_sub(2);
        if interior < ranks {
            return Err(SorError::ProblemTooSmall {
                interior_rows: interior,
                ranks,
            });
        }

        let rows = n - 1;
        let nlarge = rows % ranks;
        let size_small = rows / ranks;
        let size_large = size_small + 1;

        let (lb, ub) = if rank < nlarge {
            let lb = rank * size_large;
            (lb, lb + size_large)
        } else {
            let lb = nlarge * size_large + (rank - nlarge) * size_small;
            (lb, lb + size_small)
        };
        // row 0 is static
        let lb = lb.max(1);
        debug_assert!(lb < ub);

        Ok(Self {
            n,
            ranks,
            rank,
            lb,
            ub,
        })
    }

    /// Partitions of every rank, in rank order.
    pub fn all(n: usize, ranks: usize) -> Result<Vec<Self>, SorError> {
        (0..ranks).map(|r| Self::compute(n, ranks, r)).collect()
    }

    pub fn rows(&self) -> Range<usize> {
        self.lb..self.ub
    }
    pub fn len(&self) -> usize {
        self.ub - self.lb
    }
    pub fn is_empty(&self) -> bool {
        self.lb >= self.ub
    }
    pub fn is_first(&self) -> bool {
        self.rank == 0
    }
    pub fn is_last(&self) -> bool {
        self.rank + 1 == self.ranks
    }
}

/// SOR parameters derived from the grid size alone, so every rank computes
/// the same values without communicating.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SorParams {
    /// Spectral radius of the Jacobi iteration.
    pub r: f64,
    pub omega: f64,
    pub stopdiff: f64,
}

impl SorParams {
    pub fn for_grid(n: usize) -> Self {
        let (nrow, ncol) = (n as f64, n as f64);
        let r = 0.5 * ((PI / ncol).cos() + (PI / nrow).cos());
        let optimal = 2.0 / (1.0 + (1.0 - r * r).sqrt());
        Self {
            r,
            omega: optimal * OMEGA_DAMPING,
            stopdiff: TOLERANCE / (2.0 - optimal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remainder_goes_to_low_ranks() {
        // 11 rows [0, 11) over 3 ranks: 4, 4, 3
        let parts = Partition::all(12, 3).unwrap();
        let bounds: Vec<_> = parts.iter().map(|p| (p.lb, p.ub)).collect();
        assert_eq!(bounds, vec![(1, 4), (4, 8), (8, 11)]);
    }

    #[test]
    fn single_rank_owns_all_interior_rows() {
        let p = Partition::compute(10, 1, 0).unwrap();
        assert_eq!(p.rows(), 1..9);
        assert!(p.is_first() && p.is_last());
    }

    #[test]
    fn too_few_interior_rows_is_rejected() {
        assert_eq!(
            Partition::compute(4, 3, 0),
            Err(SorError::ProblemTooSmall {
                interior_rows: 2,
                ranks: 3
            })
        );
        assert!(Partition::compute(5, 3, 0).is_ok());
    }

    #[test]
    fn params_are_in_range() {
        let p = SorParams::for_grid(18);
        assert!(p.r > 0.0 && p.r < 1.0);
        assert!(p.omega > 1.0 && p.omega < 2.0);
        assert!(p.stopdiff > TOLERANCE);
    }

    proptest! {
        #[test]
        fn partitions_cover_interior_exactly_once(n in 3usize..300, ranks in 1usize..40) {
            prop_assume!(n - 2 >= ranks);
            let parts = Partition::all(n, ranks).unwrap();
            let mut next = 1;
            for p in &parts {
                prop_assert!(!p.is_empty());
                prop_assert_eq!(p.lb, next);
                next = p.ub;
            }
            prop_assert_eq!(next, n - 1);
            prop_assert!(parts.iter().all(|p| (p.lb == 0) <= p.is_first()));
            prop_assert!(parts.iter().all(|p| (p.ub == n - 1) <= p.is_last()));
        }
    }
}
