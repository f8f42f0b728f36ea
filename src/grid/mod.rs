// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Shared uv grids and sum-of-weights accumulators.

Grids are 4-D, shaped `(ny, nx, npol, nchan)` with even `ny`/`nx`. The y
axis comes first so the image plane can be split into disjoint horizontal
bands with `axis_chunks_iter_mut`; each gridding worker owns one band and
writes nothing outside it, so no locking is needed. Every worker keeps a
private partial sum-of-weights, reduced (associative, order-independent)
after the parallel region closes: the final grid content is independent of
worker count up to floating-point summation order.
 */


use marlu::c64;
use ndarray::prelude::*;

use crate::constants::MAX_GRID_WORKERS;

/// A complex-valued visibility grid.
pub struct UvGrid {
    /// `(ny, nx, npol, nchan)`.
    pub data: Array4<c64>,
}

/// A real-valued weight-density grid with the same axis conventions.
/// Mosaic gridders scatter the imaging weights here alongside the data;
/// its transform is the spatial sensitivity pattern.
pub struct WeightGrid {
    pub data: Array4<f64>,
}

/// Per-(pol,chan) total imaging weight actually gridded. Read once at
/// finalize time to normalize the image and detect no-data conditions.
pub type SumOfWeights = Array2<f64>;

impl UvGrid {
    pub fn new(ny: usize, nx: usize, npol: usize, nchan: usize) -> UvGrid {
        assert!(ny % 2 == 0 && nx % 2 == 0, "grid dimensions must be even");
        UvGrid {
            data: Array4::zeros((ny, nx, npol, nchan)),
        }
    }

    pub fn ny(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn nx(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn npol(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn nchan(&self) -> usize {
        self.data.shape()[3]
    }
}

impl WeightGrid {
    pub fn new(ny: usize, nx: usize, npol: usize, nchan: usize) -> WeightGrid {
        assert!(ny % 2 == 0 && nx % 2 == 0, "grid dimensions must be even");
        WeightGrid {
            data: Array4::zeros((ny, nx, npol, nchan)),
        }
    }

    pub fn ny(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn nx(&self) -> usize {
        self.data.shape()[1]
    }
}

/// How many rows of the grid each of `n_workers` bands gets. The last band
/// absorbs the remainder.
pub(crate) fn band_rows(ny: usize, n_workers: usize) -> usize {
    let n = n_workers.clamp(1, MAX_GRID_WORKERS);
    (ny + n - 1) / n
}

/// Reduce per-worker partial sum-of-weights matrices. Addition is
/// associative and order-independent here; imaging normalization tolerates
/// the last-ULP differences that reordering can introduce.
pub(crate) fn reduce_sumwt(partials: impl IntoIterator<Item = SumOfWeights>) -> Option<SumOfWeights> {
    partials.into_iter().reduce(|a, b| a + b)
}
