// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics: FFT-friendly grid sizes and the small dense
//! matrix inversions used by the wideband primary-beam correction.

#[cfg(test)]
mod tests;

use marlu::c64;
use ndarray::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MathError {
    #[error("Matrix is singular and cannot be inverted: {matrix:?}")]
    Singular { matrix: Vec<f64> },

    #[error("Matrix is not symmetric positive definite: {matrix:?}")]
    NotPosDef { matrix: Vec<f64> },
}

/// `e^{ix}` by Euler's formula; `x` is the (real) phase in radians.
#[inline]
pub(crate) fn cexp(x: f64) -> c64 {
    let (im, re) = x.sin_cos();
    c64::new(re, im)
}

/// Is `n` 5-smooth, i.e. composed only of the prime factors 2, 3 and 5?
/// These sizes keep the FFT cheap.
fn is_5_smooth(mut n: usize) -> bool {
    if n == 0 {
        return false;
    }
    for f in [2, 3, 5] {
        while n % f == 0 {
            n /= f;
        }
    }
    n == 1
}

/// The smallest *even* 5-smooth number that is at least `n`. Grid
/// dimensions must be even so that the centre pixel and the FFT-shift
/// quadrant swaps are well defined.
pub fn next_even_composite(n: usize) -> usize {
    let mut c = n.max(2);
    if c % 2 == 1 {
        c += 1;
    }
    while !is_5_smooth(c) {
        c += 2;
    }
    c
}

/// Invert a small square matrix by LU decomposition with partial pivoting.
///
/// The per-pixel beam Hessians are not guaranteed symmetric, so this is a
/// general inversion. A singular matrix is a hard error carrying the matrix
/// contents; in practice it indicates bad input data or configuration, not
/// a per-pixel anomaly.
pub fn invert_lu(m: &Array2<f64>) -> Result<Array2<f64>, MathError> {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());

    // Decompose a working copy in place, tracking row swaps.
    let mut lu = m.clone();
    let mut perm: Vec<usize> = (0..n).collect();
    for k in 0..n {
        let mut p = k;
        let mut max = lu[(k, k)].abs();
        for i in k + 1..n {
            if lu[(i, k)].abs() > max {
                max = lu[(i, k)].abs();
                p = i;
            }
        }
        if max == 0.0 {
            return Err(MathError::Singular {
                matrix: m.iter().copied().collect(),
            });
        }
        if p != k {
            perm.swap(p, k);
            for j in 0..n {
                let tmp = lu[(k, j)];
                lu[(k, j)] = lu[(p, j)];
                lu[(p, j)] = tmp;
            }
        }
        for i in k + 1..n {
            let factor = lu[(i, k)] / lu[(k, k)];
            lu[(i, k)] = factor;
            for j in k + 1..n {
                lu[(i, j)] -= factor * lu[(k, j)];
            }
        }
    }

    // Solve for each column of the identity.
    let mut inv = Array2::zeros((n, n));
    let mut col = vec![0.0; n];
    for c in 0..n {
        for (i, x) in col.iter_mut().enumerate() {
            *x = if perm[i] == c { 1.0 } else { 0.0 };
        }
        // Forward substitution (unit lower triangle).
        for i in 1..n {
            for j in 0..i {
                col[i] -= lu[(i, j)] * col[j];
            }
        }
        // Back substitution.
        for i in (0..n).rev() {
            for j in i + 1..n {
                col[i] -= lu[(i, j)] * col[j];
            }
            col[i] /= lu[(i, i)];
        }
        for i in 0..n {
            inv[(i, c)] = col[i];
        }
    }
    Ok(inv)
}

/// Invert a small symmetric positive definite matrix via Cholesky
/// decomposition. Used for the global integrated beam Hessian, which is SPD
/// by construction.
pub fn invert_spd(m: &Array2<f64>) -> Result<Array2<f64>, MathError> {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());

    // Lower-triangular Cholesky factor.
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = m[(i, j)];
            for k in 0..j {
                sum -= l[(i, k)] * l[(j, k)];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(MathError::NotPosDef {
                        matrix: m.iter().copied().collect(),
                    });
                }
                l[(i, j)] = sum.sqrt();
            } else {
                l[(i, j)] = sum / l[(j, j)];
            }
        }
    }

    // Invert L, then form L^-T L^-1.
    let mut linv = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        linv[(i, i)] = 1.0 / l[(i, i)];
        for j in 0..i {
            let mut sum = 0.0;
            for k in j..i {
                sum -= l[(i, k)] * linv[(k, j)];
            }
            linv[(i, j)] = sum / l[(i, i)];
        }
    }
    let mut inv = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let mut sum = 0.0;
            for k in i.max(j)..n {
                sum += linv[(k, i)] * linv[(k, j)];
            }
            inv[(i, j)] = sum;
        }
    }
    Ok(inv)
}
