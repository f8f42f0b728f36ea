// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
W-projection gridding and degridding engine for radio-interferometric
imaging.

The crate converts irregularly-sampled interferometric visibilities into a
regular Fourier-domain grid (and back), applying convolution-function-based
anti-aliasing, primary-beam correction and multi-Taylor-term wideband
modelling. It is a library invoked by an external imaging control loop; no
CLI or wire protocol lives here.
 */

pub mod beam;
pub mod constants;
pub mod convfunc;
pub mod engine;
pub mod error;
pub mod grid;
pub mod image;
pub mod math;
pub mod multiterm;
pub mod resample;
pub mod vis;

// Re-exports.
pub use beam::{normalize_image, BeamError, NormKind, PbAction, PrimaryBeamCorrector};
pub use constants::*;
pub use convfunc::{KernelCache, KernelFamily, KernelTable, TabulatedKernel, WKernelSet};
pub use engine::{GridderConfig, GridderError, GridderRecord, GriddingEngine, SubGridderKind};
pub use error::HypergridError;
pub use grid::{SumOfWeights, UvGrid, WeightGrid};
pub use image::{ComplexImage, ImageGeometry, SkyImage};
pub use multiterm::{MultiTermConfig, MultiTermCoordinator, MultiTermError, MultiTermRecord};
pub use vis::{VisBatch, VisKind};

// External re-exports.
pub use marlu::{c64, RADec, UVW};
