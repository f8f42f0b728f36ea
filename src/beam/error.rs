// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with primary-beam correction.

use thiserror::Error;

use crate::math::MathError;

#[derive(Error, Debug)]
pub enum BeamError {
    #[error("Expected {thing} to have shape {expected:?}, but it had {actual:?} instead")]
    ShapeMismatch {
        thing: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("This normalization needs an average primary beam, but none has been built")]
    MissingAveragePb,

    #[error("Wideband beam coefficients have not been calculated yet")]
    CoefficientsNotReady,

    #[error("Beam-coefficient cache file {path} is malformed")]
    MalformedCache { path: String },

    // A singular beam Hessian means bad input data or configuration, not a
    // recoverable per-pixel condition; the matrix contents ride along in
    // the diagnostic.
    #[error(transparent)]
    Math(#[from] MathError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
