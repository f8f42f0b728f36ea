// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Primary-beam correction.

An average power beam is accumulated from weight grids during PSF/weight
passes, peak-normalized exactly once and then frozen; later passes must
never re-trigger its construction. For wideband imaging the beam's spectral
behaviour is modelled as a Taylor polynomial in normalized frequency
offset: a small Hessian of beam coefficients is built, inverted, and
applied to (or removed from) the per-Taylor-term sky images. Pixels at or
below `pb_limit` are zeroed rather than divided; that region of the beam
cannot be reliably deconvolved.
 */

mod error;
#[cfg(test)]
mod tests;

pub use error::BeamError;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use ndarray::prelude::*;
use strum_macros::Display;

use crate::math::{invert_lu, invert_spd};

/// The normalization applied by [`normalize_image`]. The integer codes
/// conventional in imaging frameworks are noted on each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NormKind {
    /// Divide by the sum of weights (normType 0); the standard
    /// residual/PSF normalization.
    SumWeight,
    /// Divide pixel-wise by the average PB where it exceeds `pb_limit`,
    /// zero elsewhere (normType 1).
    PbDivide,
    /// Multiply by the average PB (normType 3): re-instate flat-noise
    /// weighting before minor-cycle accumulation.
    PbMultiply,
    /// As `PbDivide` with sqrt(PB): amplitude rather than power beam
    /// (normType 4).
    PbSqrtDivide,
    /// As `PbMultiply` with sqrt(PB) (normType 5).
    PbSqrtMultiply,
}

/// Whether [`PrimaryBeamCorrector::apply_wide_band_pb`] removes the beam
/// polynomial from the images (divide) or re-applies it (multiply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PbAction {
    Divide,
    Multiply,
}

/// The general-purpose image normalization primitive. `image` is
/// `(ny, nx, npol, nchan)`, `sumwt` is `(npol, nchan)`, and `avg_pb` (when
/// the kind needs it) is a single `(ny, nx)` power-beam plane applied to
/// every (pol,chan).
///
/// The pb-limit boundary is strictly-greater-keeps: a pixel where the beam
/// equals `pb_limit` exactly is zeroed.
pub fn normalize_image(
    image: &mut Array4<f64>,
    sumwt: &Array2<f64>,
    avg_pb: Option<&Array2<f64>>,
    kind: NormKind,
    pb_limit: f64,
) -> Result<(), BeamError> {
    let (ny, nx, npol, nchan) = image.dim();
    if sumwt.dim() != (npol, nchan) {
        return Err(BeamError::ShapeMismatch {
            thing: "sum-of-weights matrix",
            expected: vec![npol, nchan],
            actual: sumwt.shape().to_vec(),
        });
    }

    match kind {
        NormKind::SumWeight => {
            for pol in 0..npol {
                for chan in 0..nchan {
                    let wt = sumwt[(pol, chan)];
                    let mut plane = image.slice_mut(s![.., .., pol, chan]);
                    if wt > 0.0 {
                        plane.mapv_inplace(|v| v / wt);
                    } else {
                        // Avoid NaN/Inf from a no-data plane.
                        plane.fill(0.0);
                    }
                }
            }
        }
        NormKind::PbDivide | NormKind::PbMultiply | NormKind::PbSqrtDivide
        | NormKind::PbSqrtMultiply => {
            let pb = avg_pb.ok_or(BeamError::MissingAveragePb)?;
            if pb.dim() != (ny, nx) {
                return Err(BeamError::ShapeMismatch {
                    thing: "average primary beam",
                    expected: vec![ny, nx],
                    actual: pb.shape().to_vec(),
                });
            }
            for pol in 0..npol {
                for chan in 0..nchan {
                    let mut plane = image.slice_mut(s![.., .., pol, chan]);
                    for ((y, x), v) in plane.indexed_iter_mut() {
                        let b = pb[(y, x)];
                        match kind {
                            NormKind::PbDivide => {
                                *v = if b.abs() > pb_limit { *v / b } else { 0.0 };
                            }
                            NormKind::PbMultiply => *v *= b,
                            NormKind::PbSqrtDivide => {
                                *v = if b.abs() > pb_limit {
                                    *v / b.abs().sqrt()
                                } else {
                                    0.0
                                };
                            }
                            NormKind::PbSqrtMultiply => *v *= b.abs().sqrt(),
                            NormKind::SumWeight => unreachable!(),
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Accumulates the average primary beam and the wideband Taylor
/// coefficients of the beam, each computed exactly once per imaging
/// session and frozen behind a latch.
pub struct PrimaryBeamCorrector {
    pb_limit: f64,
    cache_dir: Option<PathBuf>,
    avg_pb: Option<Array2<f64>>,
    avg_pb_ready: bool,
    pb_coeffs: Vec<Array2<f64>>,
    done_pb_taylor: bool,
}

impl PrimaryBeamCorrector {
    pub fn new(pb_limit: f64, cache_dir: Option<PathBuf>) -> PrimaryBeamCorrector {
        PrimaryBeamCorrector {
            pb_limit,
            cache_dir,
            avg_pb: None,
            avg_pb_ready: false,
            pb_coeffs: vec![],
            done_pb_taylor: false,
        }
    }

    pub fn pb_limit(&self) -> f64 {
        self.pb_limit
    }

    /// The frozen average beam, if it has been built and normalized.
    pub fn avg_pb(&self) -> Option<&Array2<f64>> {
        if self.avg_pb_ready {
            self.avg_pb.as_ref()
        } else {
            None
        }
    }

    /// Accumulate one weight plane into the average beam. After
    /// [`PrimaryBeamCorrector::freeze_average_pb`] this is a no-op: later
    /// PSF passes must not rebuild the beam.
    pub fn accumulate_pb(&mut self, weight_plane: ArrayView2<f64>) -> Result<(), BeamError> {
        if self.avg_pb_ready {
            debug!("Average PB already frozen; ignoring further accumulation");
            return Ok(());
        }
        match self.avg_pb.as_mut() {
            None => {
                self.avg_pb = Some(weight_plane.to_owned());
            }
            Some(pb) => {
                if pb.dim() != weight_plane.dim() {
                    return Err(BeamError::ShapeMismatch {
                        thing: "weight plane",
                        expected: pb.shape().to_vec(),
                        actual: weight_plane.shape().to_vec(),
                    });
                }
                *pb += &weight_plane;
            }
        }
        Ok(())
    }

    /// Normalize the accumulated beam by its own peak and freeze it; it is
    /// never re-derived afterwards.
    pub fn freeze_average_pb(&mut self) -> Result<(), BeamError> {
        if self.avg_pb_ready {
            return Ok(());
        }
        let pb = self.avg_pb.as_mut().ok_or(BeamError::MissingAveragePb)?;
        let peak = pb.iter().cloned().fold(f64::MIN, f64::max);
        if peak > 0.0 {
            pb.mapv_inplace(|v| v / peak);
        } else {
            warn!("Average PB peak is not positive; freezing unnormalized");
        }
        self.avg_pb_ready = true;
        Ok(())
    }

    pub fn done_pb_taylor(&self) -> bool {
        self.done_pb_taylor
    }

    pub fn pb_coeffs(&self) -> &[Array2<f64>] {
        &self.pb_coeffs
    }

    /// Build the global wideband beam coefficients: a single
    /// pixel-independent Hessian from the *integrated* per-Taylor-pair sum
    /// of weights, inverted once (it is SPD by construction) and applied
    /// to the stacked weight images. Each coefficient image is persisted
    /// to the cache directory so later major cycles reload instead of
    /// recomputing; outputs below `pb_limit^(t+2)` are zeroed.
    ///
    /// Latched: the second and later calls leave the coefficients
    /// bit-identical and do no work.
    pub fn calculate_taylor_pbs(
        &mut self,
        weight_images: &[Array2<f64>],
        sumweights: &[f64],
        nterms: usize,
    ) -> Result<(), BeamError> {
        if self.done_pb_taylor {
            debug!("Wideband PB coefficients already calculated; not re-triggering");
            return Ok(());
        }
        if weight_images.len() < nterms || sumweights.len() < 2 * nterms - 1 {
            return Err(BeamError::ShapeMismatch {
                thing: "Taylor weight images / integrated sum-weights",
                expected: vec![nterms, 2 * nterms - 1],
                actual: vec![weight_images.len(), sumweights.len()],
            });
        }

        if let Some(cached) = self.try_load_cached(nterms, weight_images[0].dim())? {
            info!("Loaded {nterms} wideband PB coefficient images from cache");
            self.pb_coeffs = cached;
            self.done_pb_taylor = true;
            return Ok(());
        }

        // H[i][j] = integrated weight of Taylor pair (i + j).
        let mut hess = Array2::zeros((nterms, nterms));
        for i in 0..nterms {
            for j in 0..nterms {
                hess[(i, j)] = sumweights[i + j];
            }
        }
        let hinv = invert_spd(&hess)?;
        let mut coeffs = multiply_h_matrix(&hinv, &weight_images[..nterms]);

        for (t, coeff) in coeffs.iter_mut().enumerate() {
            let floor = self.pb_limit.powi(t as i32 + 2);
            coeff.mapv_inplace(|v| if v.abs() > floor { v } else { 0.0 });
        }

        if let Some(dir) = &self.cache_dir {
            for (t, coeff) in coeffs.iter().enumerate() {
                write_plane(&coeff_path(dir, t), coeff)?;
            }
            debug!("Persisted {nterms} PB coefficient images to {dir:?}");
        }

        self.pb_coeffs = coeffs;
        self.done_pb_taylor = true;
        Ok(())
    }

    /// The per-pixel polynomial beam correction. For every pixel where the
    /// zeroth coefficient exceeds `pb_limit`, builds the `N x N` Toeplitz
    /// system `H[i][j] = coeff_{|i-j|}(pixel)`, and either multiplies its
    /// inverse (`Divide`) or the matrix itself (`Multiply`) into the
    /// stacked per-Taylor pixel vector. Pixels at or below the limit are
    /// forced to exactly zero in every output image.
    ///
    /// A singular per-pixel matrix fails the whole operation; it signals a
    /// data or configuration problem, not a pixel anomaly.
    pub fn apply_wide_band_pb(
        &self,
        action: PbAction,
        taylor_images: &mut [Array2<f64>],
    ) -> Result<(), BeamError> {
        if !self.done_pb_taylor {
            return Err(BeamError::CoefficientsNotReady);
        }
        let nterms = taylor_images.len();
        if nterms == 0 {
            return Ok(());
        }
        if self.pb_coeffs.len() < nterms {
            return Err(BeamError::ShapeMismatch {
                thing: "PB coefficient stack",
                expected: vec![nterms],
                actual: vec![self.pb_coeffs.len()],
            });
        }
        let (ny, nx) = taylor_images[0].dim();

        let mut h = Array2::zeros((nterms, nterms));
        let mut vin = vec![0.0; nterms];
        for y in 0..ny {
            for x in 0..nx {
                let c0 = self.pb_coeffs[0][(y, x)];
                if c0.abs() > self.pb_limit {
                    for i in 0..nterms {
                        for j in 0..nterms {
                            h[(i, j)] = self.pb_coeffs[i.abs_diff(j)][(y, x)];
                        }
                        vin[i] = taylor_images[i][(y, x)];
                    }
                    match action {
                        PbAction::Divide => {
                            let hinv = invert_lu(&h)?;
                            for (t, image) in taylor_images.iter_mut().enumerate() {
                                image[(y, x)] =
                                    (0..nterms).map(|j| hinv[(t, j)] * vin[j]).sum();
                            }
                        }
                        PbAction::Multiply => {
                            for (t, image) in taylor_images.iter_mut().enumerate() {
                                image[(y, x)] = (0..nterms).map(|j| h[(t, j)] * vin[j]).sum();
                            }
                        }
                    }
                } else {
                    // Cannot reliably deconvolve the beam here.
                    for image in taylor_images.iter_mut() {
                        image[(y, x)] = 0.0;
                    }
                }
            }
        }
        Ok(())
    }

    fn try_load_cached(
        &self,
        nterms: usize,
        dim: (usize, usize),
    ) -> Result<Option<Vec<Array2<f64>>>, BeamError> {
        let Some(dir) = &self.cache_dir else {
            return Ok(None);
        };
        let mut coeffs = Vec::with_capacity(nterms);
        for t in 0..nterms {
            let path = coeff_path(dir, t);
            if !path.exists() {
                return Ok(None);
            }
            let plane = read_plane(&path)?;
            if plane.dim() != dim {
                warn!("Cached PB coefficient {t} has the wrong shape; recomputing");
                return Ok(None);
            }
            coeffs.push(plane);
        }
        Ok(Some(coeffs))
    }
}

/// Apply a small matrix to a stack of images:
/// `out[t] = sum_j m[t][j] * images[j]`.
fn multiply_h_matrix(m: &Array2<f64>, images: &[Array2<f64>]) -> Vec<Array2<f64>> {
    let n = m.nrows();
    (0..n)
        .map(|t| {
            let mut out = Array2::zeros(images[0].dim());
            for (j, image) in images.iter().enumerate().take(n) {
                out.scaled_add(m[(t, j)], image);
            }
            out
        })
        .collect()
}

fn coeff_path(dir: &Path, t: usize) -> PathBuf {
    dir.join(format!("pbcoeff_{t}.dat"))
}

/// Little-endian binary plane: ny, nx as u64 then row-major f64 pixels.
fn write_plane(path: &Path, plane: &Array2<f64>) -> Result<(), BeamError> {
    let mut w = BufWriter::new(File::create(path)?);
    let (ny, nx) = plane.dim();
    w.write_u64::<LittleEndian>(ny as u64)?;
    w.write_u64::<LittleEndian>(nx as u64)?;
    for v in plane.iter() {
        w.write_f64::<LittleEndian>(*v)?;
    }
    Ok(())
}

fn read_plane(path: &Path) -> Result<Array2<f64>, BeamError> {
    let mut r = BufReader::new(File::open(path)?);
    let ny = r.read_u64::<LittleEndian>()? as usize;
    let nx = r.read_u64::<LittleEndian>()? as usize;
    let mut data = Vec::with_capacity(ny * nx);
    for _ in 0..ny * nx {
        data.push(r.read_f64::<LittleEndian>()?);
    }
    Array2::from_shape_vec((ny, nx), data).map_err(|_| BeamError::MalformedCache {
        path: path.display().to_string(),
    })
}
