// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;

use super::*;

#[test]
fn test_grdsf_reference_values() {
    // psi(0) from the Schwab fit: p(0.5625 - ...) evaluated at eta = 0.
    let x = -0.5625;
    let top = 8.203343e-2 + x * (-3.644705e-1 + x * (6.278660e-1 + x * (-5.335581e-1 + x * 2.312756e-1)));
    let bot = 1.0 + x * (8.212018e-1 + x * 2.078043e-1);
    assert_abs_diff_eq!(grdsf(0.0), top / bot, epsilon = 1e-15);

    // Monotonically decreasing on [0, 1], positive, zero outside.
    let mut last = grdsf(0.0);
    for i in 1..=100 {
        let v = grdsf(i as f64 / 100.0);
        assert!(v > 0.0);
        assert!(v < last);
        last = v;
    }
    assert_abs_diff_eq!(grdsf(1.2), 0.0);

    // Even function.
    assert_abs_diff_eq!(grdsf(-0.3), grdsf(0.3));
}

#[test]
fn test_kernel_unit_tap_sum() {
    for (family, support) in [
        (KernelFamily::NearestNeighbour, 0),
        (KernelFamily::Box, 0),
        (KernelFamily::Spheroidal, 3),
        (KernelFamily::Spheroidal, 7),
    ] {
        let k = KernelTable::new(family, support, 20);
        let sum: f64 = (-(k.support as isize)..=k.support as isize)
            .map(|dx| k.tap(0, dx))
            .sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-14);
    }
}

#[test]
fn test_kernel_symmetry() {
    let k = KernelTable::new(KernelFamily::Spheroidal, 3, 20);
    // At zero sub-cell offset the taps are symmetric about the centre cell.
    for dx in 1..=3isize {
        assert_abs_diff_eq!(k.tap(0, dx), k.tap(0, -dx));
    }
    // A half-cell offset mirrors between the two straddling cells.
    assert_abs_diff_eq!(k.tap(10, 0), k.tap(10, 1), epsilon = 1e-15);
}

#[test]
fn test_kernel_taps_decay() {
    let k = KernelTable::new(KernelFamily::Spheroidal, 7, 20);
    let mut last = k.tap(0, 0);
    for dx in 1..=7isize {
        let v = k.tap(0, dx);
        assert!(v < last);
        assert!(v >= 0.0);
        last = v;
    }
    // Beyond the support everything is zero.
    assert_abs_diff_eq!(k.tap(0, 8), 0.0);
    assert_abs_diff_eq!(k.tap(19, 8), 0.0);
}

#[test]
fn test_zero_support_is_nearest_grid_point() {
    let k = KernelTable::new(KernelFamily::Spheroidal, 0, 20);
    assert_eq!(k.support, 0);
    assert_abs_diff_eq!(k.tap(0, 0), 1.0);
    assert_abs_diff_eq!(k.tap(0, 1), 0.0);
    assert!(k.correction(64).iter().all(|&c| c == 1.0));
}

#[test]
fn test_correction_centre_normalized() {
    for (family, support) in [
        (KernelFamily::Box, 0),
        (KernelFamily::Spheroidal, 3),
        (KernelFamily::NearestNeighbour, 0),
    ] {
        let k = KernelTable::new(family, support, 20);
        let c = k.correction(128);
        assert_abs_diff_eq!(c[64], 1.0, epsilon = 1e-15);
        // Symmetric about the centre pixel.
        for i in 1..64 {
            assert_abs_diff_eq!(c[64 - i], c[64 + i], epsilon = 1e-12);
        }
        // The taper correction never amplifies the centre relative to the
        // edge the wrong way around: corrections decrease towards edges.
        assert!(c[1] <= c[64]);
    }
}

#[test]
fn test_rebuilds_are_idempotent() {
    let a = KernelTable::new(KernelFamily::Spheroidal, 5, 20);
    let b = KernelTable::new(KernelFamily::Spheroidal, 5, 20);
    // Bit-for-bit: reproducible imaging depends on it.
    assert_eq!(a, b);
}

#[test]
fn test_cache_reuses_and_trims() {
    let mut cache = KernelCache::new(20, 8);
    let mut builds = 0;
    let build = |support: usize, oversampling: usize| {
        // A narrow Gaussian that dies off well inside the max support.
        (0..(support + 1) * oversampling)
            .map(|i| {
                let x = i as f64 / oversampling as f64;
                (-x * x).exp()
            })
            .collect::<Vec<_>>()
    };

    let k1 = cache.get_or_build((0, 0), |s, o| {
        builds += 1;
        build(s, o)
    });
    assert_eq!(builds, 1);
    // exp(-x^2) < 1e-3 for x > ~2.63, so the trimmed support is small.
    assert!(k1.support < 8);

    let k2 = cache.get_or_build((0, 0), |s, o| {
        builds += 1;
        build(s, o)
    });
    assert_eq!(builds, 1, "cache hit must not rebuild");
    assert!(Arc::ptr_eq(&k1, &k2));
    assert_eq!(cache.len(), 1);

    cache.get_or_build((1, 0), build);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_full_width_profile_keeps_max_support_quietly() {
    // A profile that exactly fills its table is not oversize: it keeps
    // max_support and the warning counter stays untouched.
    let mut cache = KernelCache::new(20, 8);
    let k = cache.get_or_build((0, 0), |s, o| vec![1.0; (s + 1) * o]);
    assert_eq!(k.support, 8);
    assert_eq!(cache.oversize_count(), 0);

    // A genuinely wider profile still clamps and counts.
    let mut cache = KernelCache::new(20, 8);
    let k = cache.get_or_build((0, 0), |s, o| vec![1.0; (s + 3) * o]);
    assert_eq!(k.support, 8);
    assert_eq!(cache.oversize_count(), 1);
}

#[test]
fn test_cache_kernels_unit_tap_sum() {
    let mut cache = KernelCache::new(20, 8);
    let k = cache.get_or_build((0, 0), |s, o| {
        (0..(s + 1) * o)
            .map(|i| {
                let x = i as f64 / o as f64;
                (-x * x).exp()
            })
            .collect()
    });
    let sum: f64 = (-(k.support as isize)..=k.support as isize)
        .map(|dx| k.tap(0, dx))
        .sum();
    assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-14);
}

#[test]
fn test_w_kernel_set_binning_and_broadening() {
    let fov = 0.032;
    let w_max = 2.5e4;
    let mut cache = KernelCache::new(20, 16);
    let planes: Vec<_> = (0..4usize)
        .map(|iw| {
            cache.get_or_build((iw, 0), |ms, ov| {
                let w = (iw * iw) as f64 / (9.0 / w_max);
                w_kernel_profile(w, fov, 3, ms, ov)
            })
        })
        .collect();
    // Kernels broaden with w.
    let (s0, s3) = (planes[0].support, planes[3].support);
    assert!(s3 > s0);

    let set = WKernelSet::new(planes, w_max);
    assert_eq!(set.n_planes(), 4);
    assert_eq!(set.max_support(), s3);
    // Quadratic binning: plane 0 at w = 0, the last plane at w_max, and
    // anything beyond clamps to it.
    assert_eq!(set.plane_index(0.0), 0);
    assert_eq!(set.plane_index(w_max), 3);
    assert_eq!(set.plane_index(10.0 * w_max), 3);
    // Symmetric in the sign of w.
    assert_eq!(set.plane_index(-0.4 * w_max), set.plane_index(0.4 * w_max));
}
