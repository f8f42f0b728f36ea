// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
The put/get convolutional resampling core.

`put` scatters each weighted visibility over a `(2*support + 1)^2` window
of separable kernel taps around its fractional uv cell; `get` is the
adjoint gather from a model grid. Workers own disjoint horizontal bands of
the grid (see [`crate::grid`]); every worker scans the whole row batch and
writes only the taps that land in its band, so there is no locking.

The sum of weights accumulated here is the weight *before* any kernel
factor: the kernel's own integral is undone later by the image-plane grid
correction.
 */


use marlu::c64;
use ndarray::{parallel::prelude::*, prelude::*};

use crate::constants::{TAU, VEL_C};
use crate::convfunc::{KernelTable, TabulatedKernel, WKernelSet};
use crate::grid::{band_rows, reduce_sumwt, SumOfWeights, UvGrid, WeightGrid};
use crate::math::cexp;
use crate::vis::{VisBatch, VisKind};
use std::sync::Arc;

/// The kernel table one sample draws its taps from.
#[derive(Clone, Copy)]
enum Taps<'a> {
    AntiAlias(&'a KernelTable),
    WPlane(&'a TabulatedKernel),
}

impl Taps<'_> {
    #[inline]
    fn support(self) -> isize {
        match self {
            Taps::AntiAlias(k) => k.support as isize,
            Taps::WPlane(k) => k.support as isize,
        }
    }

    #[inline]
    fn tap(self, off: isize, dx: isize) -> f64 {
        match self {
            Taps::AntiAlias(k) => k.tap(off, dx),
            Taps::WPlane(k) => k.tap(off, dx),
        }
    }
}

/// Maps (u,v,w) samples to fractional grid cells and applies the
/// convolution passes. Immutable during gridding; shared by all workers.
pub struct VisibilityResampler {
    kernel: Arc<KernelTable>,
    /// Per-w-plane kernels; samples select by |w| when present, otherwise
    /// every sample grids with the anti-aliasing kernel above.
    w_kernels: Option<WKernelSet>,
    /// Wavelengths-to-cells scale: `nx * cell_x`, `ny * cell_y`.
    u_scale: f64,
    v_scale: f64,
    /// Grid-centre offsets: `nx/2`, `ny/2`.
    u_offset: f64,
    v_offset: f64,
    /// Optional (dl, dm) field-offset phase rotation.
    phase_offset: Option<(f64, f64)>,
    /// Grid autocorrelations too.
    use_zero: bool,
    n_workers: usize,
}

impl VisibilityResampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel: Arc<KernelTable>,
        nx: usize,
        ny: usize,
        cell_x: f64,
        cell_y: f64,
        use_zero: bool,
        n_workers: usize,
    ) -> VisibilityResampler {
        VisibilityResampler {
            kernel,
            w_kernels: None,
            u_scale: nx as f64 * cell_x,
            v_scale: ny as f64 * cell_y,
            u_offset: (nx / 2) as f64,
            v_offset: (ny / 2) as f64,
            phase_offset: None,
            use_zero,
            n_workers,
        }
    }

    /// Install w-projection kernels: from now on every sample selects the
    /// tabulated kernel of its w-plane instead of the anti-aliasing table.
    pub fn set_w_kernels(&mut self, set: WKernelSet) {
        self.w_kernels = Some(set);
    }

    /// The tap source for a sample with the given w (in wavelengths).
    #[inline]
    fn taps(&self, w_lambda: f64) -> Taps {
        match &self.w_kernels {
            Some(set) => Taps::WPlane(set.kernel(w_lambda)),
            None => Taps::AntiAlias(&self.kernel),
        }
    }

    /// Apply a pointing/field-offset phase rotation (direction cosines
    /// relative to the phase centre) to everything resampled from now on.
    pub fn set_phase_offset(&mut self, dl: f64, dm: f64) {
        self.phase_offset = if dl == 0.0 && dm == 0.0 {
            None
        } else {
            Some((dl, dm))
        };
    }

    /// The fractional grid position for a (u,v) in metres at `freq`.
    #[inline]
    fn grid_pos(&self, u: f64, v: f64, freq: f64) -> (f64, f64) {
        let one_on_lambda = freq / VEL_C;
        (
            u * one_on_lambda * self.u_scale + self.u_offset,
            v * one_on_lambda * self.v_scale + self.v_offset,
        )
    }

    #[inline]
    fn phasor(&self, u: f64, v: f64, freq: f64) -> Option<c64> {
        self.phase_offset.map(|(dl, dm)| {
            let one_on_lambda = freq / VEL_C;
            cexp(TAU * (u * dl + v * dm) * one_on_lambda)
        })
    }

    /// Visibility -> grid. `rows` selects a single row, or all rows when
    /// `None`. With `dopsf`, unit-amplitude data is substituted (same
    /// weights and flags) to build the point-spread function. `weights`
    /// overrides the batch's imaging weights when given (the multi-term
    /// coordinator passes per-Taylor-term scaled copies).
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        vb: &VisBatch,
        rows: Option<usize>,
        dopsf: bool,
        kind: VisKind,
        weights: Option<&Array2<f64>>,
        grid: &mut UvGrid,
        sumwt: &mut SumOfWeights,
    ) {
        let weights = weights.unwrap_or(&vb.weights);
        debug_assert_eq!(weights.dim(), vb.weights.dim());
        let (ny, nx, npol, nchan) = (grid.ny(), grid.nx(), grid.npol(), grid.nchan());
        let row_range = match rows {
            Some(r) => r..r + 1,
            None => 0..vb.n_rows(),
        };
        let oversampling = self.kernel.oversampling as f64;
        let cube = vb.cube(kind);
        let band = band_rows(ny, self.n_workers);

        let partials: Vec<SumOfWeights> = grid
            .data
            .axis_chunks_iter_mut(Axis(0), band)
            .into_par_iter()
            .enumerate()
            .map(|(i_band, mut band_view)| {
                let y0 = (i_band * band) as isize;
                let y1 = y0 + band_view.shape()[0] as isize;
                let mut wt_sum = SumOfWeights::zeros((npol, nchan));

                for row in row_range.clone() {
                    if vb.row_flags[row] {
                        continue;
                    }
                    let (ant1, ant2) = vb.ant_pairs[row];
                    if ant1 == ant2 && !self.use_zero {
                        continue;
                    }
                    let uvw = vb.uvws[row];

                    for (ch, &freq) in vb.freqs.iter().enumerate() {
                        let Some(gchan) = vb.chan_map[ch] else {
                            continue;
                        };
                        if vb.flags[(row, ch)] {
                            continue;
                        }
                        // The batch's own weight decides whether a sample
                        // is usable; an override value (a Taylor-scaled
                        // copy) may legitimately be negative.
                        if vb.weights[(row, ch)] <= 0.0 {
                            continue;
                        }
                        let wt = weights[(row, ch)];

                        let taps = self.taps(uvw.w * freq / VEL_C);
                        let support = taps.support();
                        let (pos_x, pos_y) = self.grid_pos(uvw.u, uvw.v, freq);
                        let loc_x = pos_x.round() as isize;
                        let loc_y = pos_y.round() as isize;
                        // Footprints off the grid are expected at mosaic
                        // edges; drop them silently.
                        if loc_x - support < 0
                            || loc_x + support >= nx as isize
                            || loc_y - support < 0
                            || loc_y + support >= ny as isize
                        {
                            continue;
                        }
                        let off_x = ((pos_x - loc_x as f64) * oversampling).round() as isize;
                        let off_y = ((pos_y - loc_y as f64) * oversampling).round() as isize;
                        let phasor = self.phasor(uvw.u, uvw.v, freq);

                        // Exactly one band owns this sample's weight: the
                        // one containing its centre row.
                        let owns_weight = loc_y >= y0 && loc_y < y1;

                        for (pol, gpol) in vb.pol_map.iter().enumerate() {
                            let Some(gpol) = *gpol else {
                                continue;
                            };
                            let v = if dopsf {
                                c64::new(1.0, 0.0)
                            } else {
                                match phasor {
                                    Some(p) => cube[(row, ch, pol)] * p,
                                    None => cube[(row, ch, pol)],
                                }
                            };
                            let vw = v * wt;

                            for dy in -support..=support {
                                let gy = loc_y + dy;
                                if gy < y0 || gy >= y1 {
                                    continue;
                                }
                                let ky = taps.tap(off_y, dy);
                                for dx in -support..=support {
                                    let kx = taps.tap(off_x, dx);
                                    let gx = (loc_x + dx) as usize;
                                    band_view[((gy - y0) as usize, gx, gpol, gchan)] +=
                                        vw * (kx * ky);
                                }
                            }
                            if owns_weight {
                                wt_sum[(gpol, gchan)] += wt;
                            }
                        }
                    }
                }
                wt_sum
            })
            .collect();

        if let Some(p) = reduce_sumwt(partials) {
            *sumwt += &p;
        }
    }

    /// Scatter the imaging weights themselves over the same kernel
    /// footprints, accumulating the uv weight density whose transform is
    /// the spatial sensitivity pattern. Same row/flag/footprint policy as
    /// [`VisibilityResampler::put`]; serial, as the real-valued adds are
    /// small work next to the data grid.
    pub fn put_weight_density(
        &self,
        vb: &VisBatch,
        rows: Option<usize>,
        weights: Option<&Array2<f64>>,
        wgrid: &mut WeightGrid,
    ) {
        let weights = weights.unwrap_or(&vb.weights);
        let (ny, nx) = (wgrid.ny(), wgrid.nx());
        let oversampling = self.kernel.oversampling as f64;
        let row_range = match rows {
            Some(r) => r..r + 1,
            None => 0..vb.n_rows(),
        };

        for row in row_range {
            if vb.row_flags[row] {
                continue;
            }
            let (ant1, ant2) = vb.ant_pairs[row];
            if ant1 == ant2 && !self.use_zero {
                continue;
            }
            let uvw = vb.uvws[row];

            for (ch, &freq) in vb.freqs.iter().enumerate() {
                let Some(gchan) = vb.chan_map[ch] else {
                    continue;
                };
                if vb.flags[(row, ch)] || vb.weights[(row, ch)] <= 0.0 {
                    continue;
                }
                let wt = weights[(row, ch)];

                let taps = self.taps(uvw.w * freq / VEL_C);
                let support = taps.support();
                let (pos_x, pos_y) = self.grid_pos(uvw.u, uvw.v, freq);
                let loc_x = pos_x.round() as isize;
                let loc_y = pos_y.round() as isize;
                if loc_x - support < 0
                    || loc_x + support >= nx as isize
                    || loc_y - support < 0
                    || loc_y + support >= ny as isize
                {
                    continue;
                }
                let off_x = ((pos_x - loc_x as f64) * oversampling).round() as isize;
                let off_y = ((pos_y - loc_y as f64) * oversampling).round() as isize;

                for gpol in vb.pol_map.iter().flatten() {
                    for dy in -support..=support {
                        let ky = taps.tap(off_y, dy);
                        let gy = (loc_y + dy) as usize;
                        for dx in -support..=support {
                            let kx = taps.tap(off_x, dx);
                            let gx = (loc_x + dx) as usize;
                            wgrid.data[(gy, gx, *gpol, gchan)] += wt * (kx * ky);
                        }
                    }
                }
            }
        }
    }

    /// Grid -> visibility: the adjoint gather. Writes the model cube of
    /// `vb`; rows whose footprint misses the grid are left untouched. The
    /// grid is read-only here, so rows parallelize freely.
    pub fn get(&self, vb: &mut VisBatch, rows: Option<usize>, grid: &UvGrid) {
        let (ny, nx) = (grid.ny(), grid.nx());
        let oversampling = self.kernel.oversampling as f64;

        // Split borrows: everything but the model cube is read-only.
        let uvws = &vb.uvws;
        let ant_pairs = &vb.ant_pairs;
        let freqs = &vb.freqs;
        let row_flags = &vb.row_flags;
        let flags = &vb.flags;
        let pol_map = &vb.pol_map;
        let chan_map = &vb.chan_map;
        let grid_data = &grid.data;

        let (mut model, row0) = match rows {
            Some(r) => (vb.model.slice_mut(s![r..r + 1, .., ..]), r),
            None => (vb.model.view_mut(), 0),
        };

        model
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .for_each(|(i, mut model_cp)| {
                let row = row0 + i;
                if row_flags[row] {
                    return;
                }
                let (ant1, ant2) = ant_pairs[row];
                if ant1 == ant2 && !self.use_zero {
                    return;
                }
                let uvw = uvws[row];

                for (ch, &freq) in freqs.iter().enumerate() {
                    let Some(gchan) = chan_map[ch] else {
                        continue;
                    };
                    if flags[(row, ch)] {
                        continue;
                    }

                    let taps = self.taps(uvw.w * freq / VEL_C);
                    let support = taps.support();
                    let (pos_x, pos_y) = self.grid_pos(uvw.u, uvw.v, freq);
                    let loc_x = pos_x.round() as isize;
                    let loc_y = pos_y.round() as isize;
                    if loc_x - support < 0
                        || loc_x + support >= nx as isize
                        || loc_y - support < 0
                        || loc_y + support >= ny as isize
                    {
                        continue;
                    }
                    let off_x = ((pos_x - loc_x as f64) * oversampling).round() as isize;
                    let off_y = ((pos_y - loc_y as f64) * oversampling).round() as isize;
                    // The inverse of the put-side rotation.
                    let conj_phasor = self.phasor(uvw.u, uvw.v, freq).map(|p| p.conj());

                    for (pol, gpol) in pol_map.iter().enumerate() {
                        let Some(gpol) = *gpol else {
                            continue;
                        };
                        let mut acc = c64::new(0.0, 0.0);
                        for dy in -support..=support {
                            let ky = taps.tap(off_y, dy);
                            let gy = (loc_y + dy) as usize;
                            for dx in -support..=support {
                                let kx = taps.tap(off_x, dx);
                                let gx = (loc_x + dx) as usize;
                                acc += grid_data[(gy, gx, gpol, gchan)] * (kx * ky);
                            }
                        }
                        model_cp[(ch, pol)] = match conj_phasor {
                            Some(p) => acc * p,
                            None => acc,
                        };
                    }
                }
            });
    }
}
