// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with the gridding engine.

use thiserror::Error;

use super::SessionState;

#[derive(Error, Debug)]
pub enum GridderError {
    #[error("Gridder is in state {got}, expected {expected}. Did you call an initialize twice without finalizing, or put/get before initializing?")]
    StateMachine {
        expected: &'static str,
        got: SessionState,
    },

    #[error("No useful data: the sum of gridded weights is zero everywhere, so a normalized image would be meaningless")]
    AllWeightsZero,

    #[error("Expected {thing} to have shape {expected:?}, but it had {actual:?} instead")]
    ShapeMismatch {
        /// What didn't have a sensible shape? Model image, weight matrix,
        /// etc.
        thing: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("'{name}' is not a supported gridder kind")]
    UnsupportedGridder { name: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
