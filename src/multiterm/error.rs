// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Errors associated with multi-term coordination.

use thiserror::Error;

use super::MtState;
use crate::beam::BeamError;
use crate::engine::GridderError;

#[derive(Error, Debug)]
pub enum MultiTermError {
    #[error("Multi-term imaging needs at least one Taylor term")]
    BadTermCount,

    #[error("The reference frequency must be positive, got {freq_hz} Hz")]
    BadRefFreq { freq_hz: f64 },

    #[error("Expected the coordinator to be {expected}, but it was {got}")]
    StateMachine { expected: &'static str, got: MtState },

    #[error("Expected {expected} per-Taylor-term model images, got {actual}")]
    WrongModelCount { expected: usize, actual: usize },

    #[error("Multi-term record is malformed: {reason}")]
    MalformedRecord { reason: String },

    #[error(transparent)]
    Gridder(#[from] GridderError),

    #[error(transparent)]
    Beam(#[from] BeamError),
}
