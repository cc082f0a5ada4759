//! Minimum cost rectangular linear assignment.
//!
//! Shortest augmenting path formulation of the Hungarian algorithm, O(n^2 m)
//! for an `n x m` matrix with `n <= m`. Non-finite cells are forbidden pairings.

use nalgebra::{DMatrix, Scalar};
use num_traits::Float;

use crate::error::AssignmentError;

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment<T> {
    /// Column assigned to each row. Exactly `min(rows, cols)` rows are assigned.
    pub row_to_col: Vec<Option<usize>>,
    pub total_cost: T,
}

impl<T> Assignment<T> {
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.row_to_col
            .iter()
            .enumerate()
            .filter_map(|(row, col)| col.map(|col| (row, col)))
    }

    pub fn col_to_row(&self, cols: usize) -> Vec<Option<usize>> {
        let mut out = vec![None; cols];
        for (row, col) in self.pairs() {
            out[col] = Some(row);
        }
        out
    }
}

pub fn solve<T: Float + Scalar>(costs: &DMatrix<T>) -> Result<Assignment<T>, AssignmentError> {
    let (rows, cols) = costs.shape();
    if rows <= cols {
        let row_to_col = solve_wide(costs)?;
        Ok(finish(costs, row_to_col))
    } else {
        let transposed = costs.transpose();
        let col_to_row = solve_wide(&transposed)?;
        let mut row_to_col = vec![None; rows];
        for (col, row) in col_to_row.iter().enumerate() {
            if let Some(row) = row {
                row_to_col[*row] = Some(col);
            }
        }
        Ok(finish(costs, row_to_col))
    }
}

fn finish<T: Float + Scalar>(costs: &DMatrix<T>, row_to_col: Vec<Option<usize>>) -> Assignment<T> {
    let total_cost = row_to_col
        .iter()
        .enumerate()
        .filter_map(|(row, col)| col.map(|col| costs[(row, col)]))
        .fold(T::zero(), |acc, c| acc + c);
    Assignment {
        row_to_col,
        total_cost,
    }
}

fn solve_wide<T: Float + Scalar>(costs: &DMatrix<T>) -> Result<Vec<Option<usize>>, AssignmentError> {
    let (n, m) = costs.shape();
    let infeasible = AssignmentError::Infeasible { rows: n, cols: m };
    let inf = T::infinity();
    let cost = |i: usize, j: usize| {
        let c = costs[(i - 1, j - 1)];
        if c.is_finite() {
            c
        } else {
            inf
        }
    };

    // 1-based potentials, column 0 is the virtual source
    let mut u = vec![T::zero(); n + 1];
    let mut v = vec![T::zero(); m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![inf; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost(i0, j) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            if j1 == 0 || !delta.is_finite() {
                return Err(infeasible);
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] = u[p[j]] + delta;
                    v[j] = v[j] - delta;
                } else {
                    minv[j] = minv[j] - delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![None; n];
    for j in 1..=m {
        if p[j] != 0 {
            row_to_col[p[j] - 1] = Some(j - 1);
        }
    }
    Ok(row_to_col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    /// Cheapest assignment of `min(rows, cols)` pairs by enumeration.
    fn brute_force(costs: &DMatrix<f64>) -> f64 {
        fn recurse(costs: &DMatrix<f64>, row: usize, used: &mut Vec<bool>, left: usize) -> f64 {
            if left == 0 {
                return 0.;
            }
            if row == costs.nrows() {
                return f64::INFINITY;
            }
            // rows may stay unassigned only when there are more rows than columns
            let mut best = if costs.nrows() - row > left {
                recurse(costs, row + 1, used, left)
            } else {
                f64::INFINITY
            };
            for col in 0..costs.ncols() {
                if used[col] || !costs[(row, col)].is_finite() {
                    continue;
                }
                used[col] = true;
                let c = costs[(row, col)] + recurse(costs, row + 1, used, left - 1);
                used[col] = false;
                best = best.min(c);
            }
            best
        }
        let mut used = vec![false; costs.ncols()];
        recurse(costs, 0, &mut used, costs.nrows().min(costs.ncols()))
    }

    #[test]
    fn test_square() {
        let costs = DMatrix::from_row_slice(3, 3, &[4., 1., 3., 2., 0., 5., 3., 2., 2.]);
        let assignment = solve(&costs).unwrap();
        assert_eq!(assignment.total_cost, 5.);
        assert_eq!(assignment.row_to_col, vec![Some(1), Some(0), Some(2)]);
        assert_eq!(assignment.col_to_row(3), vec![Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_matches_brute_force() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for _ in 0..300 {
            let rows = rng.gen_range(1..=5);
            let cols = rng.gen_range(1..=5);
            let costs = DMatrix::from_fn(rows, cols, |_, _| {
                if rng.gen_bool(0.15) {
                    f64::INFINITY
                } else {
                    rng.gen_range(0.0..100.0)
                }
            });
            let expected = brute_force(&costs);
            match solve(&costs) {
                Ok(assignment) => {
                    assert!(
                        (assignment.total_cost - expected).abs() < 1e-9,
                        "{costs} solver {} brute force {expected}",
                        assignment.total_cost
                    );
                    assert_eq!(assignment.pairs().count(), rows.min(cols));
                }
                Err(_) => assert!(expected.is_infinite(), "{costs}"),
            }
        }
    }

    #[test]
    fn test_rectangular() {
        let tall = DMatrix::from_row_slice(3, 2, &[1., 9., 9., 1., 5., 5.]);
        let assignment = solve(&tall).unwrap();
        assert_eq!(assignment.row_to_col, vec![Some(0), Some(1), None]);
        assert_eq!(assignment.total_cost, 2.);

        let wide = tall.transpose();
        let assignment = solve(&wide).unwrap();
        assert_eq!(assignment.row_to_col, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_empty_and_infeasible() {
        let empty = DMatrix::<f64>::zeros(0, 3);
        assert!(solve(&empty).unwrap().row_to_col.is_empty());
        let no_cols = DMatrix::<f64>::zeros(2, 0);
        assert_eq!(solve(&no_cols).unwrap().row_to_col, vec![None, None]);

        let inf = f64::INFINITY;
        let costs = DMatrix::from_row_slice(2, 2, &[inf, inf, 1., 2.]);
        assert_eq!(
            solve(&costs),
            Err(AssignmentError::Infeasible { rows: 2, cols: 2 })
        );
    }

    #[test]
    fn test_single_precision() {
        let costs = DMatrix::from_row_slice(2, 2, &[1f32, 2., 2., 1.]);
        assert_eq!(solve(&costs).unwrap().total_cost, 2f32);
    }
}
