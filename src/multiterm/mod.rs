// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Multi-Taylor-term wideband coordination.

The coordinator presents the same one-direction-per-pass interface as a
single [`GriddingEngine`], but fans every request out across a fixed set of
`2N - 1` sub-engines (N = number of Taylor terms). A PSF/weight pass grids
all `2N - 1` of them; a residual or model pass only the first N. Term t
grids with a per-term *copy* of the imaging weights scaled by
`((f - f0) / f0)^t`, so the caller's weight buffer is never touched and
term order is irrelevant by construction.

Primary-beam handling follows the conjugate-beams convention: models are
divided by the frozen average beam before degridding and images are
re-multiplied by it after gridding. The non-conjugate alternative, which
applies the full polynomial beam correction instead, is kept but logged as
legacy.
 */

mod error;

pub use error::MultiTermError;

use std::path::PathBuf;

use itertools::izip;
use log::{debug, warn};
use marlu::c64;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::beam::{normalize_image, NormKind, PbAction, PrimaryBeamCorrector};
use crate::engine::{GridderConfig, GridderError, GridderRecord, GriddingEngine, SubGridderKind};
use crate::grid::SumOfWeights;
use crate::image::{ComplexImage, ImageGeometry, SkyImage};
use crate::vis::{VisBatch, VisKind};

/// Where the coordinator is in its one-direction-per-pass life cycle.
/// Mirrors the sub-engines' states; validated here as well so misuse is
/// reported against the coordinator, not a sub-engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MtState {
    Idle,
    ToSky,
    SkyFinalized,
    ToVis,
    VisFinalized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTermConfig {
    /// Number of Taylor terms N; `2N - 1` sub-engines are owned.
    pub nterms: usize,
    /// Reference frequency f0 for the normalized offset `(f - f0) / f0`.
    pub ref_freq_hz: f64,
    /// Conjugate-beams convention: divide models by the frozen average
    /// beam before degridding, re-multiply images after gridding. When
    /// false the legacy polynomial correction is applied instead.
    pub use_conj_beams: bool,
    /// Configuration shared by every sub-engine.
    pub engine: GridderConfig,
    /// Where beam-coefficient images persist between major cycles.
    pub cache_dir: Option<PathBuf>,
}

impl Default for MultiTermConfig {
    fn default() -> MultiTermConfig {
        MultiTermConfig {
            nterms: 2,
            ref_freq_hz: 150e6,
            use_conj_beams: true,
            engine: GridderConfig::default(),
            cache_dir: None,
        }
    }
}

/// The serialized form of a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTermRecord {
    pub nterms: usize,
    pub ref_freq_hz: f64,
    pub use_conj_beams: bool,
    pub cache_dir: Option<String>,
    pub engines: Vec<GridderRecord>,
}

pub struct MultiTermCoordinator {
    config: MultiTermConfig,
    state: MtState,
    /// Always `2N - 1` engines; passes use a prefix of them.
    engines: Vec<GriddingEngine>,
    corrector: PrimaryBeamCorrector,
    /// The current to-sky pass is building the PSF.
    doing_psf: bool,
    /// A PSF pass has completed; later PSF requests grid only N terms.
    done_psf: bool,
    /// How many engines the most recent to-sky pass actually gridded.
    last_pass_terms: usize,
}

impl MultiTermCoordinator {
    pub fn new(config: MultiTermConfig) -> Result<MultiTermCoordinator, MultiTermError> {
        if config.nterms == 0 {
            return Err(MultiTermError::BadTermCount);
        }
        if !(config.ref_freq_hz > 0.0) {
            return Err(MultiTermError::BadRefFreq {
                freq_hz: config.ref_freq_hz,
            });
        }
        let n_engines = 2 * config.nterms - 1;
        let engines = (0..n_engines)
            .map(|_| GriddingEngine::new(config.engine.clone()))
            .collect();
        let corrector = PrimaryBeamCorrector::new(config.engine.pb_limit, config.cache_dir.clone());
        let nterms = config.nterms;
        Ok(MultiTermCoordinator {
            config,
            state: MtState::Idle,
            engines,
            corrector,
            doing_psf: false,
            done_psf: false,
            last_pass_terms: nterms,
        })
    }

    pub fn config(&self) -> &MultiTermConfig {
        &self.config
    }

    pub fn state(&self) -> MtState {
        self.state
    }

    pub fn done_psf(&self) -> bool {
        self.done_psf
    }

    /// The beam corrector, for callers that feed it real beam planes
    /// rather than the gridded sensitivity pattern.
    pub fn beam(&self) -> &PrimaryBeamCorrector {
        &self.corrector
    }

    pub fn beam_mut(&mut self) -> &mut PrimaryBeamCorrector {
        &mut self.corrector
    }

    pub fn sum_of_weights(&self, term: usize) -> &SumOfWeights {
        self.engines[term].sum_of_weights()
    }

    fn expect_state(&self, expected: MtState, label: &'static str) -> Result<(), MultiTermError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MultiTermError::StateMachine {
                expected: label,
                got: self.state,
            })
        }
    }

    /// `((f - f0) / f0)^t`.
    fn taylor_factor(&self, freq: f64, t: usize) -> f64 {
        ((freq - self.config.ref_freq_hz) / self.config.ref_freq_hz).powi(t as i32)
    }

    /// Begin a gridding pass on every sub-engine. Whether the pass is a
    /// PSF pass is decided by the `dopsf` flag of the `put` calls.
    pub fn initialize_to_sky(&mut self, geometry: &ImageGeometry) -> Result<(), MultiTermError> {
        match self.state {
            MtState::Idle | MtState::SkyFinalized | MtState::VisFinalized => {}
            got => {
                return Err(MultiTermError::StateMachine {
                    expected: "Idle or a finalized state",
                    got,
                })
            }
        }
        for engine in &mut self.engines {
            engine.initialize_to_sky(geometry)?;
        }
        self.doing_psf = false;
        self.last_pass_terms = self.config.nterms;
        self.state = MtState::ToSky;
        Ok(())
    }

    /// Grid one batch across the Taylor terms: term 0 unmodified, term t
    /// with weights scaled by the per-channel Taylor factor. A PSF pass
    /// before the first `finalize_to_sky` grids all `2N - 1` terms so the
    /// beam Hessian can be built; afterwards N suffice.
    pub fn put(
        &mut self,
        vb: &VisBatch,
        rows: Option<usize>,
        dopsf: bool,
        kind: VisKind,
    ) -> Result<(), MultiTermError> {
        self.expect_state(MtState::ToSky, "ToSky")?;
        let grid_terms = if dopsf && !self.done_psf {
            2 * self.config.nterms - 1
        } else {
            self.config.nterms
        };
        if dopsf {
            self.doing_psf = true;
        }
        self.last_pass_terms = grid_terms;

        self.engines[0].put(vb, rows, dopsf, kind)?;
        for t in 1..grid_terms {
            let mut scaled = vb.weights.clone();
            for (mut col, &freq) in scaled.axis_iter_mut(Axis(1)).zip(&vb.freqs) {
                let f = self.taylor_factor(freq, t);
                col.mapv_inplace(|w| w * f);
            }
            self.engines[t].put_weighted(vb, rows, dopsf, kind, Some(&scaled))?;
        }
        Ok(())
    }

    /// End the gridding pass. After a PSF pass on a mosaic gridder, this
    /// is where the average beam freezes and the wideband beam
    /// coefficients are computed (both exactly once per session).
    pub fn finalize_to_sky(&mut self) -> Result<(), MultiTermError> {
        self.expect_state(MtState::ToSky, "ToSky")?;
        for engine in &mut self.engines {
            engine.finalize_to_sky()?;
        }
        if self.doing_psf && self.config.engine.kind == SubGridderKind::MosaicPb {
            self.wire_primary_beam()?;
        }
        if self.doing_psf {
            self.done_psf = true;
            self.doing_psf = false;
        }
        self.state = MtState::SkyFinalized;
        Ok(())
    }

    /// Retrieve the per-term images of the finished pass. Term 0 is
    /// normalized by its own sum of weights; higher terms by term 0's (a
    /// Taylor sum of weights may legitimately be negative). For a mosaic
    /// gridder the beam is re-applied afterwards so minor-cycle
    /// accumulation stays in the flat-noise convention.
    pub fn get_images(
        &mut self,
        weights_out: &mut Vec<SumOfWeights>,
        normalize: bool,
    ) -> Result<Vec<SkyImage>, MultiTermError> {
        self.expect_state(MtState::SkyFinalized, "SkyFinalized")?;
        weights_out.clear();
        let mut images = Vec::with_capacity(self.last_pass_terms);
        for (t, engine) in self.engines.iter_mut().take(self.last_pass_terms).enumerate() {
            let mut wt = SumOfWeights::zeros((0, 0));
            let image = engine.get_image(&mut wt, normalize && t == 0)?;
            weights_out.push(wt);
            images.push(image.to_real());
        }
        if normalize && !images.is_empty() {
            let wt0 = weights_out[0].clone();
            for image in images.iter_mut().skip(1) {
                normalize_image(
                    &mut image.data,
                    &wt0,
                    None,
                    NormKind::SumWeight,
                    self.corrector.pb_limit(),
                )?;
            }
        }
        if self.config.engine.kind == SubGridderKind::MosaicPb {
            self.post_normalize(&mut images, weights_out)?;
        }
        self.state = MtState::Idle;
        Ok(images)
    }

    /// Begin a degridding pass: one model image per Taylor term. With
    /// conjugate beams the models are presented to the sub-engines in
    /// flat-sky (beam-divided) form.
    pub fn initialize_to_vis(&mut self, models: &[ComplexImage]) -> Result<(), MultiTermError> {
        match self.state {
            MtState::Idle | MtState::SkyFinalized | MtState::VisFinalized => {}
            got => {
                return Err(MultiTermError::StateMachine {
                    expected: "Idle or a finalized state",
                    got,
                })
            }
        }
        if models.len() != self.config.nterms {
            return Err(MultiTermError::WrongModelCount {
                expected: self.config.nterms,
                actual: models.len(),
            });
        }

        let pb = if self.config.engine.kind == SubGridderKind::MosaicPb
            && self.config.use_conj_beams
        {
            self.corrector.avg_pb().cloned()
        } else {
            None
        };
        for (engine, model) in self.engines.iter_mut().zip(models) {
            match &pb {
                Some(pb) => {
                    let mut flat = model.clone();
                    apply_pb(&mut flat.data, pb, PbAction::Divide, self.corrector.pb_limit());
                    engine.initialize_to_vis(&flat)?;
                }
                None => engine.initialize_to_vis(model)?,
            }
        }
        self.state = MtState::ToVis;
        Ok(())
    }

    /// Predict model visibilities: term 0 directly, then each higher term
    /// degridded separately, scaled by its Taylor factor and accumulated.
    pub fn get(&self, vb: &mut VisBatch, rows: Option<usize>) -> Result<(), MultiTermError> {
        self.expect_state(MtState::ToVis, "ToVis")?;
        self.engines[0].get(vb, rows)?;
        if self.config.nterms == 1 {
            return Ok(());
        }

        let mut accum = vb.model.clone();
        for t in 1..self.config.nterms {
            vb.model.fill(c64::new(0.0, 0.0));
            self.engines[t].get(vb, rows)?;
            for (mut acc, term, &freq) in izip!(
                accum.axis_iter_mut(Axis(1)),
                vb.model.axis_iter(Axis(1)),
                &vb.freqs
            ) {
                let f = self.taylor_factor(freq, t);
                acc.zip_mut_with(&term, |a, &b| *a += b * f);
            }
        }
        vb.model.assign(&accum);
        Ok(())
    }

    pub fn finalize_to_vis(&mut self) -> Result<(), MultiTermError> {
        self.expect_state(MtState::ToVis, "ToVis")?;
        for engine in self.engines.iter_mut().take(self.config.nterms) {
            engine.finalize_to_vis()?;
        }
        self.state = MtState::VisFinalized;
        Ok(())
    }

    /// Serialize the coordinator's configuration, including every
    /// sub-engine's record.
    pub fn to_record(&self) -> MultiTermRecord {
        MultiTermRecord {
            nterms: self.config.nterms,
            ref_freq_hz: self.config.ref_freq_hz,
            use_conj_beams: self.config.use_conj_beams,
            cache_dir: self
                .config
                .cache_dir
                .as_ref()
                .map(|p| p.display().to_string()),
            engines: self.engines.iter().map(GriddingEngine::to_record).collect(),
        }
    }

    pub fn from_record(record: &MultiTermRecord) -> Result<MultiTermCoordinator, MultiTermError> {
        if record.nterms == 0 {
            return Err(MultiTermError::BadTermCount);
        }
        if record.engines.len() != 2 * record.nterms - 1 {
            return Err(MultiTermError::MalformedRecord {
                reason: format!(
                    "{} Taylor terms need {} sub-engine records, found {}",
                    record.nterms,
                    2 * record.nterms - 1,
                    record.engines.len()
                ),
            });
        }
        let engines = record
            .engines
            .iter()
            .map(GriddingEngine::from_record)
            .collect::<Result<Vec<_>, GridderError>>()?;
        let config = MultiTermConfig {
            nterms: record.nterms,
            ref_freq_hz: record.ref_freq_hz,
            use_conj_beams: record.use_conj_beams,
            engine: engines[0].config().clone(),
            cache_dir: record.cache_dir.as_ref().map(PathBuf::from),
        };
        let mut coordinator = MultiTermCoordinator::new(config)?;
        coordinator.engines = engines;
        Ok(coordinator)
    }

    /// Feed the beam corrector from the finished PSF pass: the term-0
    /// integrated weight plane accumulates into the average beam, and the
    /// `2N - 1` integrated sums of weights build the wideband Hessian.
    /// Both steps are latched inside the corrector.
    fn wire_primary_beam(&mut self) -> Result<(), MultiTermError> {
        let nterms = self.config.nterms;
        let sumweights: Vec<f64> = self
            .engines
            .iter()
            .map(|e| e.sum_of_weights().sum())
            .collect();
        if sumweights.iter().all(|&s| s == 0.0) {
            warn!("PSF pass gridded no data; not deriving a primary beam from it");
            return Ok(());
        }

        // Weight plane per engine, summed over (pol, chan).
        let planes = self
            .engines
            .iter()
            .map(|e| {
                let wi = e.get_weight_image(e.sum_of_weights())?;
                Ok(wi.data.sum_axis(Axis(3)).sum_axis(Axis(2)))
            })
            .collect::<Result<Vec<Array2<f64>>, GridderError>>()?;

        self.corrector.accumulate_pb(planes[0].view())?;
        self.corrector.freeze_average_pb()?;
        self.corrector
            .calculate_taylor_pbs(&planes[..nterms], &sumweights, nterms)?;
        Ok(())
    }

    /// Re-apply the beam to the retrieved images, per the configured
    /// convention.
    fn post_normalize(
        &self,
        images: &mut [SkyImage],
        weights: &[SumOfWeights],
    ) -> Result<(), MultiTermError> {
        if images.is_empty() {
            return Ok(());
        }
        if self.config.use_conj_beams {
            match self.corrector.avg_pb() {
                Some(pb) => {
                    for (image, wt) in images.iter_mut().zip(weights) {
                        normalize_image(
                            &mut image.data,
                            wt,
                            Some(pb),
                            NormKind::PbMultiply,
                            self.corrector.pb_limit(),
                        )?;
                    }
                }
                None => debug!("No frozen average PB yet; skipping the post-gridding multiply"),
            }
        } else if self.corrector.done_pb_taylor() {
            warn!(
                "Applying the legacy polynomial wideband beam correction; the average-beam \
                 convention is the supported one"
            );
            let n = self.config.nterms.min(images.len());
            let (_, _, npol, nchan) = images[0].data.dim();
            for pol in 0..npol {
                for chan in 0..nchan {
                    let mut planes: Vec<Array2<f64>> = images[..n]
                        .iter()
                        .map(|im| im.data.slice(s![.., .., pol, chan]).to_owned())
                        .collect();
                    self.corrector.apply_wide_band_pb(PbAction::Multiply, &mut planes)?;
                    for (im, plane) in images[..n].iter_mut().zip(planes) {
                        im.data.slice_mut(s![.., .., pol, chan]).assign(&plane);
                    }
                }
            }
        } else {
            debug!("Wideband beam coefficients not ready; skipping the legacy beam multiply");
        }
        Ok(())
    }
}

/// Pixel-wise beam application on a complex image; the same pb-limit
/// boundary as [`normalize_image`].
fn apply_pb(data: &mut Array4<c64>, pb: &Array2<f64>, action: PbAction, pb_limit: f64) {
    for ((y, x, _, _), v) in data.indexed_iter_mut() {
        let b = pb[(y, x)];
        match action {
            PbAction::Divide => {
                *v = if b.abs() > pb_limit {
                    *v / b
                } else {
                    c64::new(0.0, 0.0)
                };
            }
            PbAction::Multiply => *v *= b,
        }
    }
}
