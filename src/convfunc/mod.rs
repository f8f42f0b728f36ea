// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Oversampled anti-aliasing convolution functions.

A kernel table holds samples of a separable 1-D gridding function at
`oversampling` sub-cell phases per grid cell. During gridding the tap
applied at integer offset `dx` for a sample with quantized sub-cell offset
`off` is `table[|dx * oversampling - off|]`; the 2-D kernel is the outer
product of the 1-D taps. Tables are immutable once built and shared
read-only across all gridding workers.
 */

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::constants::{DEFAULT_OVERSAMPLING, DEFAULT_SUPPORT, SUPPORT_TRIM_THRESHOLD};

/// The supported anti-aliasing function families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum KernelFamily {
    /// Nearest-grid-point assignment; support 0, no image-plane correction.
    NearestNeighbour,

    /// A one-cell boxcar, corrected in the image plane by a sinc.
    Box,

    /// The prolate-spheroidal ("SF") function, the standard anti-aliasing
    /// choice: optimally concentrates energy inside the image while
    /// suppressing aliases from outside it.
    Spheroidal,
}

/// Rational approximation to the zeroth-order prolate spheroidal wave
/// function psi(eta) for m = 6, alpha = 1 (F. Schwab's fit, as tabulated in
/// the classic gridding literature). Zero outside |eta| > 1.
fn grdsf(eta: f64) -> f64 {
    const P: [[f64; 5]; 2] = [
        [
            8.203343e-2,
            -3.644705e-1,
            6.278660e-1,
            -5.335581e-1,
            2.312756e-1,
        ],
        [
            4.028559e-3,
            -3.697768e-2,
            1.021332e-1,
            -1.201436e-1,
            6.412774e-2,
        ],
    ];
    const Q: [[f64; 3]; 2] = [[1.0, 8.212018e-1, 2.078043e-1], [1.0, 9.599102e-1, 2.918724e-1]];

    let eta = eta.abs();
    let (part, eta_end) = if eta < 0.75 {
        (0, 0.75)
    } else if eta <= 1.0 {
        (1, 1.0)
    } else {
        return 0.0;
    };

    let x = eta * eta - eta_end * eta_end;
    let mut top = 0.0;
    let mut xk = 1.0;
    for p in P[part] {
        top += p * xk;
        xk *= x;
    }
    let mut bot = 0.0;
    xk = 1.0;
    for q in Q[part] {
        bot += q * xk;
        xk *= x;
    }
    top / bot
}

/// An immutable, oversampled 1-D gridding kernel plus its separable
/// image-plane correction.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTable {
    pub family: KernelFamily,
    /// Half-width of the support window in grid cells. 0 degenerates to
    /// nearest-grid-point assignment.
    pub support: usize,
    /// Sub-cell phases per grid cell.
    pub oversampling: usize,
    /// Samples indexed by `|dx * oversampling - off|`; length
    /// `(support + 1) * oversampling`.
    samples: Vec<f64>,
}

impl KernelTable {
    /// Build a kernel table. The samples are normalized so that the sum of
    /// integer-spaced taps at zero sub-cell offset is exactly 1; the
    /// kernel's remaining frequency response is compensated by the
    /// image-plane correction, so the sum of weights accumulated during
    /// gridding needs no further kernel factor.
    pub fn new(family: KernelFamily, support: usize, oversampling: usize) -> KernelTable {
        let support = match family {
            KernelFamily::NearestNeighbour | KernelFamily::Box => 0,
            KernelFamily::Spheroidal => support,
        };
        let len = (support + 1) * oversampling;
        let mut samples = vec![0.0; len];
        if support == 0 {
            // Degenerates to nearest-grid-point assignment whatever the
            // family: a unit tap for anything within half a cell.
            for (i, s) in samples.iter_mut().enumerate() {
                if i <= oversampling / 2 {
                    *s = 1.0;
                }
            }
        } else {
            let max = (support * oversampling) as f64;
            for (i, s) in samples.iter_mut().enumerate() {
                let eta = i as f64 / max;
                *s = (1.0 - eta * eta) * grdsf(eta);
            }
        }

        let mut table = KernelTable {
            family,
            support,
            oversampling,
            samples,
        };
        let sum: f64 = (-(support as isize)..=support as isize)
            .map(|dx| table.tap(0, dx))
            .sum();
        if sum > 0.0 {
            for s in table.samples.iter_mut() {
                *s /= sum;
            }
        }
        table
    }

    pub fn default_spheroidal() -> KernelTable {
        KernelTable::new(
            KernelFamily::Spheroidal,
            DEFAULT_SUPPORT,
            DEFAULT_OVERSAMPLING,
        )
    }

    /// The kernel tap for integer cell offset `dx` at quantized sub-cell
    /// offset `off` (in `[-oversampling/2, oversampling/2]`).
    #[inline]
    pub fn tap(&self, off: isize, dx: isize) -> f64 {
        let i = (dx * self.oversampling as isize - off).unsigned_abs();
        if i < self.samples.len() {
            self.samples[i]
        } else {
            0.0
        }
    }

    /// The separable image-plane grid-correction vector for a grid
    /// dimension of `n` pixels. `get_image` *divides* each pixel by
    /// `correction[ix] * correction[iy]` to undo the kernel's taper; the
    /// vector is normalized to 1 at the centre pixel so the image peak is
    /// untouched.
    pub fn correction(&self, n: usize) -> Vec<f64> {
        let half = n as f64 / 2.0;
        if self.support == 0 && self.family == KernelFamily::Spheroidal {
            // A zero-support request gridded as nearest-grid-point; the
            // spheroidal taper was never applied, so don't undo it.
            return vec![1.0; n];
        }
        match self.family {
            // A true delta in the aperture plane: flat response.
            KernelFamily::NearestNeighbour => vec![1.0; n],
            // One-cell boxcar: sinc rolloff across the padded image.
            KernelFamily::Box => (0..n)
                .map(|i| {
                    let x = std::f64::consts::PI * (i as f64 - half) / n as f64;
                    if x == 0.0 {
                        1.0
                    } else {
                        x.sin() / x
                    }
                })
                .collect(),
            // The spheroidal is an eigenfunction of the truncated Fourier
            // transform; the image-plane response is psi(nu) itself.
            KernelFamily::Spheroidal => {
                let peak = grdsf(0.0);
                (0..n)
                    .map(|i| grdsf((i as f64 - half) / half) / peak)
                    .collect()
            }
        }
    }
}

/// A tabulated (complex-free, amplitude) aperture kernel for one w-plane /
/// parallactic-angle bin, trimmed to its effective support.
#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedKernel {
    pub support: usize,
    pub oversampling: usize,
    pub samples: Vec<f64>,
}

impl TabulatedKernel {
    /// The kernel tap for integer cell offset `dx` at quantized sub-cell
    /// offset `off`; the same indexing contract as [`KernelTable::tap`].
    #[inline]
    pub fn tap(&self, off: isize, dx: isize) -> f64 {
        let i = (dx * self.oversampling as isize - off).unsigned_abs();
        if i < self.samples.len() {
            self.samples[i]
        } else {
            0.0
        }
    }
}

/// Raw oversampled amplitude profile for one w-plane: the spheroidal
/// anti-aliasing profile broadened by the Fresnel scale of that plane's w
/// (in wavelengths) over a field of `fov_radius` radians. At w = 0 this is
/// the plain spheroidal.
pub fn w_kernel_profile(
    w_lambda: f64,
    fov_radius: f64,
    base_support: usize,
    max_support: usize,
    oversampling: usize,
) -> Vec<f64> {
    let widen = (1.0 + (w_lambda * fov_radius * fov_radius).abs()).sqrt();
    let scale = widen * (base_support.max(1) * oversampling) as f64;
    (0..(max_support + 1) * oversampling)
        .map(|i| {
            let eta = i as f64 / scale;
            (1.0 - eta * eta) * grdsf(eta)
        })
        .collect()
}

/// The per-w-plane kernels a w-projecting resampler selects from, under
/// quadratic plane spacing: plane `i` covers w around `(i / (n-1))^2 *
/// w_max`, which concentrates planes at small |w| where kernels change
/// fastest. Kernels are symmetric in the sign of w.
pub struct WKernelSet {
    /// `(n_planes - 1)^2 / w_max`; 0 when there is only one plane.
    w_scale: f64,
    planes: Vec<Arc<TabulatedKernel>>,
}

impl WKernelSet {
    pub fn new(planes: Vec<Arc<TabulatedKernel>>, w_max: f64) -> WKernelSet {
        assert!(!planes.is_empty(), "a w-kernel set needs at least one plane");
        let n = planes.len();
        let w_scale = if n > 1 && w_max > 0.0 {
            ((n - 1) * (n - 1)) as f64 / w_max
        } else {
            0.0
        };
        WKernelSet { w_scale, planes }
    }

    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }

    /// The plane index for a w in wavelengths: `round(sqrt(|w| * w_scale))`,
    /// clamped to the last plane.
    pub fn plane_index(&self, w_lambda: f64) -> usize {
        let i = (w_lambda.abs() * self.w_scale).sqrt().round() as usize;
        i.min(self.planes.len() - 1)
    }

    pub fn kernel(&self, w_lambda: f64) -> &TabulatedKernel {
        &self.planes[self.plane_index(w_lambda)]
    }

    /// The widest support in the set; callers size their grid guard bands
    /// off this.
    pub fn max_support(&self) -> usize {
        self.planes.iter().map(|k| k.support).max().unwrap_or(0)
    }
}

/// Cache of kernels keyed by (w-plane, parallactic-angle bin). Rebuilds are
/// bit-for-bit idempotent because the builder is a pure function of the
/// key, which keeps repeated imaging runs reproducible.
pub struct KernelCache {
    oversampling: usize,
    max_support: usize,
    entries: HashMap<(usize, usize), Arc<TabulatedKernel>>,
    oversize_warnings: usize,
}

impl KernelCache {
    pub fn new(oversampling: usize, max_support: usize) -> KernelCache {
        KernelCache {
            oversampling,
            max_support,
            entries: HashMap::new(),
            oversize_warnings: 0,
        }
    }

    /// Get (building if absent) the kernel for a (w-plane, PA bin) key.
    /// `build` supplies raw oversampled samples; the cache trims them to
    /// the radius where the amplitude falls below [`SUPPORT_TRIM_THRESHOLD`]
    /// of the peak, which roughly halves the gridding cost.
    pub fn get_or_build<F>(&mut self, key: (usize, usize), build: F) -> Arc<TabulatedKernel>
    where
        F: FnOnce(usize, usize) -> Vec<f64>,
    {
        if let Some(k) = self.entries.get(&key) {
            return Arc::clone(k);
        }

        let oversampling = self.oversampling;
        let raw = build(self.max_support, oversampling);
        let peak = raw.iter().cloned().fold(0.0, f64::max);

        // Step in from the edge to find the effective support. A table of
        // `(s + 1) * oversampling` samples with nothing below the threshold
        // has its last significant index at `(s + 1) * oversampling - 1`,
        // which is support s exactly; only profiles genuinely wider than
        // the table budget count as oversize.
        let mut trial = raw.len();
        while trial > 1 && raw[trial - 1].abs() <= SUPPORT_TRIM_THRESHOLD * peak {
            trial -= 1;
        }
        let mut support = trial.saturating_sub(1) / oversampling;
        if support > self.max_support {
            support = self.max_support;
            self.oversize_warnings += 1;
            if self.oversize_warnings == 5 {
                warn!(
                    "Many convolution functions go beyond {} cells of support; \
                     consider a smaller image or more w-planes",
                    self.max_support
                );
            }
        }

        let len = ((support + 1) * oversampling).min(raw.len());
        let mut samples = raw[..len].to_vec();
        // The same unit integer-tap sum as KernelTable::new, so gridded
        // amplitudes need no kernel factor whichever table they came from.
        let sum: f64 = (-(support as isize)..=support as isize)
            .map(|dx| {
                let i = (dx * oversampling as isize).unsigned_abs();
                if i < samples.len() {
                    samples[i]
                } else {
                    0.0
                }
            })
            .sum();
        if sum > 0.0 {
            for s in samples.iter_mut() {
                *s /= sum;
            }
        }
        let bytes = samples.len() * std::mem::size_of::<f64>();
        debug!(
            "Tabulated kernel {key:?}: support {support} cells, {} samples ({bytes} B)",
            samples.len()
        );

        let kernel = Arc::new(TabulatedKernel {
            support,
            oversampling,
            samples,
        });
        self.entries.insert(key, Arc::clone(&kernel));
        kernel
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// How many builds have exceeded `max_support` so far.
    pub fn oversize_count(&self) -> usize {
        self.oversize_warnings
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
