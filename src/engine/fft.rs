// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Centre-origin 2-D FFTs over grid planes.

Grids and images keep the origin at the centre pixel, so each transform is
ifftshift -> rows/columns FFT -> fftshift. Both dimensions are even (the
grid-size rule guarantees it), which makes the shift an involution and the
quadrant swap exact. Transforms are unnormalized; the engine folds the
conventional `nx*ny / sumWeight` scaling into its own normalization step.
 */

use std::sync::Arc;

use marlu::c64;
use ndarray::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};

pub(crate) struct Fft2d {
    ny: usize,
    nx: usize,
    row_fft: Arc<dyn Fft<f64>>,
    col_fft: Arc<dyn Fft<f64>>,
    scratch: Vec<c64>,
    col_buf: Vec<c64>,
}

impl Fft2d {
    pub(crate) fn new(ny: usize, nx: usize, direction: FftDirection) -> Fft2d {
        let mut planner = FftPlanner::new();
        let row_fft = planner.plan_fft(nx, direction);
        let col_fft = planner.plan_fft(ny, direction);
        let scratch_len = row_fft
            .get_inplace_scratch_len()
            .max(col_fft.get_inplace_scratch_len());
        Fft2d {
            ny,
            nx,
            row_fft,
            col_fft,
            scratch: vec![c64::new(0.0, 0.0); scratch_len],
            col_buf: vec![c64::new(0.0, 0.0); ny],
        }
    }

    pub(crate) fn forward(ny: usize, nx: usize) -> Fft2d {
        Fft2d::new(ny, nx, FftDirection::Forward)
    }

    pub(crate) fn inverse(ny: usize, nx: usize) -> Fft2d {
        Fft2d::new(ny, nx, FftDirection::Inverse)
    }

    /// Transform one `(ny, nx)` plane in place, centre-origin in and out.
    pub(crate) fn process(&mut self, plane: &mut Array2<c64>) {
        assert_eq!(plane.dim(), (self.ny, self.nx));
        fftshift2(plane);

        for mut row in plane.rows_mut() {
            let slice = row.as_slice_mut().expect("plane is standard layout");
            self.row_fft.process_with_scratch(slice, &mut self.scratch);
        }

        for x in 0..self.nx {
            for (y, b) in self.col_buf.iter_mut().enumerate() {
                *b = plane[(y, x)];
            }
            self.col_fft
                .process_with_scratch(&mut self.col_buf, &mut self.scratch);
            for (y, b) in self.col_buf.iter().enumerate() {
                plane[(y, x)] = *b;
            }
        }

        fftshift2(plane);
    }
}

/// Swap quadrants so the centre pixel moves to (0,0) and back. For even
/// dimensions fftshift and ifftshift coincide.
pub(crate) fn fftshift2(plane: &mut Array2<c64>) {
    let (ny, nx) = plane.dim();
    debug_assert!(ny % 2 == 0 && nx % 2 == 0);
    let (hy, hx) = (ny / 2, nx / 2);
    for y in 0..hy {
        for x in 0..nx {
            let y2 = y + hy;
            let x2 = (x + hx) % nx;
            let tmp = plane[(y, x)];
            plane[(y, x)] = plane[(y2, x2)];
            plane[(y2, x2)] = tmp;
        }
    }
}
