// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The visibility-batch collaborator consumed by the gridding engines.

One batch is one parallel-for's worth of rows: per-row (u,v,w) and antenna
pairs, per-channel frequencies, flags, imaging weights and the visibility /
model cubes. The imaging weights are *read-only* to the engines; wideband
Taylor weighting takes per-term scaled copies rather than mutating the
caller's buffer in place.
 */

use marlu::{c64, UVW};
use ndarray::prelude::*;

/// Which cube of a [`VisBatch`] an operation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisKind {
    Observed,
    Model,
}

pub struct VisBatch {
    /// Per-row baseline coordinates \[metres\].
    pub uvws: Vec<UVW>,
    /// Per-row antenna pairs; autocorrelations (ant1 == ant2) contribute
    /// nothing unless the engine's `use_zero` flag is set.
    pub ant_pairs: Vec<(usize, usize)>,
    /// Per-channel sky frequencies \[Hz\].
    pub freqs: Vec<f64>,
    /// Per-row flags; a flagged row contributes nothing.
    pub row_flags: Vec<bool>,
    /// Per-(row,chan) flags.
    pub flags: Array2<bool>,
    /// Per-(row,chan) imaging weights.
    pub weights: Array2<f64>,
    /// Per-(row,chan,pol) observed visibilities.
    pub vis: Array3<c64>,
    /// Per-(row,chan,pol) model visibilities; written by degridding.
    pub model: Array3<c64>,
    /// Data polarization -> grid polarization plane; `None` drops the pol.
    pub pol_map: Vec<Option<usize>>,
    /// Data channel -> grid channel plane; `None` drops the channel.
    pub chan_map: Vec<Option<usize>>,
}

impl VisBatch {
    /// An unflagged, unit-weight batch with identity pol/chan maps; the
    /// usual starting point for callers that fill the cubes themselves.
    pub fn new(n_rows: usize, n_chans: usize, n_pols: usize) -> VisBatch {
        VisBatch {
            uvws: vec![
                UVW {
                    u: 0.0,
                    v: 0.0,
                    w: 0.0
                };
                n_rows
            ],
            ant_pairs: (0..n_rows).map(|r| (0, r + 1)).collect(),
            freqs: vec![0.0; n_chans],
            row_flags: vec![false; n_rows],
            flags: Array2::from_elem((n_rows, n_chans), false),
            weights: Array2::ones((n_rows, n_chans)),
            vis: Array3::zeros((n_rows, n_chans, n_pols)),
            model: Array3::zeros((n_rows, n_chans, n_pols)),
            pol_map: (0..n_pols).map(Some).collect(),
            chan_map: (0..n_chans).map(Some).collect(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.uvws.len()
    }

    pub fn n_chans(&self) -> usize {
        self.freqs.len()
    }

    pub fn n_pols(&self) -> usize {
        self.vis.shape()[2]
    }

    /// The cube selected by `kind`.
    pub(crate) fn cube(&self, kind: VisKind) -> &Array3<c64> {
        match kind {
            VisKind::Observed => &self.vis,
            VisKind::Model => &self.model,
        }
    }
}
