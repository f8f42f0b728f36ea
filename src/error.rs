// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all hypergrid-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypergridError {
    #[error(transparent)]
    Gridder(#[from] crate::engine::GridderError),

    #[error(transparent)]
    Beam(#[from] crate::beam::BeamError),

    #[error(transparent)]
    MultiTerm(#[from] crate::multiterm::MultiTermError),

    #[error(transparent)]
    Math(#[from] crate::math::MathError),
}
