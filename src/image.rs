// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The sky-image collaborator: pixel data plus the minimal world-coordinate
description the gridding core needs (cell size and phase centre). Axis
order matches the grids: `(ny, nx, npol, nchan)`. Sub-image views come for
free from ndarray slicing.
 */

use marlu::{c64, RADec};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// World-coordinate description of an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub nx: usize,
    pub ny: usize,
    pub npol: usize,
    pub nchan: usize,
    /// Cell size along x \[radians\]; negative for the usual RA direction.
    pub cell_x: f64,
    /// Cell size along y \[radians\].
    pub cell_y: f64,
    /// Phase centre.
    pub phase_centre: RADec,
}

impl ImageGeometry {
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        (self.ny, self.nx, self.npol, self.nchan)
    }
}

/// A real-valued sky image (residuals, PSFs, beams).
#[derive(Debug, Clone, PartialEq)]
pub struct SkyImage {
    pub geometry: ImageGeometry,
    /// `(ny, nx, npol, nchan)`.
    pub data: Array4<f64>,
}

/// A complex-valued image, as produced by the FFT of a uv grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexImage {
    pub geometry: ImageGeometry,
    /// `(ny, nx, npol, nchan)`.
    pub data: Array4<c64>,
}

impl SkyImage {
    pub fn zeros(geometry: ImageGeometry) -> SkyImage {
        SkyImage {
            geometry,
            data: Array4::zeros(geometry.shape()),
        }
    }

    /// A centred sub-image view of `(ny, nx)` pixels across all planes.
    pub fn centre_view(&self, ny: usize, nx: usize) -> ArrayView4<f64> {
        let (gy, gx) = (self.geometry.ny, self.geometry.nx);
        let (y0, x0) = ((gy - ny) / 2, (gx - nx) / 2);
        self.data.slice(s![y0..y0 + ny, x0..x0 + nx, .., ..])
    }
}

impl ComplexImage {
    pub fn zeros(geometry: ImageGeometry) -> ComplexImage {
        ComplexImage {
            geometry,
            data: Array4::zeros(geometry.shape()),
        }
    }

    /// The real part, as a [`SkyImage`].
    pub fn to_real(&self) -> SkyImage {
        SkyImage {
            geometry: self.geometry,
            data: self.data.mapv(|v| v.re),
        }
    }
}
