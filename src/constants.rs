// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

All constants *must* be double precision; gridding normalization is
numerically sensitive and every intermediate stays in f64.
 */

pub use std::f64::consts::{FRAC_PI_2, PI, TAU};

pub use marlu::constants::VEL_C;

/// Default kernel oversampling factor (sub-cell phases per grid cell).
pub const DEFAULT_OVERSAMPLING: usize = 20;

/// Default half-width of the spheroidal anti-aliasing kernel, in grid cells.
pub const DEFAULT_SUPPORT: usize = 3;

/// Default grid padding factor applied to the requested image size before
/// choosing an even composite grid size.
pub const DEFAULT_PADDING: f64 = 1.2;

/// Primary-beam gains at or below this level are treated as unusable;
/// beam division is replaced by zeroing there.
pub const DEFAULT_PB_LIMIT: f64 = 0.1;

/// Upper bound on gridding worker threads. The image plane is split into at
/// most this many disjoint horizontal bands, one per worker.
pub const MAX_GRID_WORKERS: usize = 4;

/// Tabulated w-plane kernels are trimmed to the radius where their
/// amplitude falls below this fraction of the peak.
pub const SUPPORT_TRIM_THRESHOLD: f64 = 1e-3;
