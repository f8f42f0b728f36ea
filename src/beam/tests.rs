// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2, Array4};

use super::*;

const PB_LIMIT: f64 = 0.1;

fn gaussian_beam(n: usize, width: f64) -> Array2<f64> {
    let c = n as f64 / 2.0;
    Array2::from_shape_fn((n, n), |(y, x)| {
        let r2 = (y as f64 - c).powi(2) + (x as f64 - c).powi(2);
        (-r2 / (2.0 * width * width)).exp()
    })
}

/// A corrector with plausible wideband coefficients already in place.
fn ready_corrector(n: usize) -> PrimaryBeamCorrector {
    let mut corrector = PrimaryBeamCorrector::new(PB_LIMIT, None);
    let pb = gaussian_beam(n, n as f64 / 6.0);
    let weight_images: Vec<_> = (0..3).map(|t| &pb * 0.2f64.powi(t)).collect();
    // Moments of a four-point frequency sampling; the Hankel matrix built
    // from these is full rank for any nterms <= 4.
    let offsets: [f64; 4] = [-0.2, -0.1, 0.1, 0.2];
    let sumweights: Vec<f64> = (0..5i32)
        .map(|k| offsets.iter().map(|x| x.powi(k)).sum())
        .collect();
    corrector
        .calculate_taylor_pbs(&weight_images, &sumweights, 3)
        .unwrap();
    corrector
}

#[test]
fn test_normalize_sum_weight() {
    let mut image = Array4::from_elem((4, 4, 1, 2), 6.0);
    let sumwt = array![[2.0, 0.0]];
    normalize_image(&mut image, &sumwt, None, NormKind::SumWeight, PB_LIMIT).unwrap();
    // Plane with weight: divided. Plane without: zeroed, not divided.
    assert_abs_diff_eq!(image[(0, 0, 0, 0)], 3.0);
    assert_abs_diff_eq!(image[(0, 0, 0, 1)], 0.0);
}

#[test]
fn test_normalize_pb_divide_respects_limit() {
    let n = 16;
    let pb = gaussian_beam(n, 2.0);
    let mut image = Array4::from_elem((n, n, 1, 1), 1.0);
    let sumwt = array![[1.0]];
    normalize_image(&mut image, &sumwt, Some(&pb), NormKind::PbDivide, PB_LIMIT).unwrap();

    for y in 0..n {
        for x in 0..n {
            let v = image[(y, x, 0, 0)];
            assert!(v.is_finite());
            if pb[(y, x)] > PB_LIMIT {
                assert_abs_diff_eq!(v, 1.0 / pb[(y, x)], epsilon = 1e-12);
            } else {
                assert_abs_diff_eq!(v, 0.0);
            }
        }
    }
}

#[test]
fn test_normalize_pb_multiply_then_divide_round_trips() {
    let n = 16;
    let pb = gaussian_beam(n, 4.0);
    let mut image = Array4::from_elem((n, n, 1, 1), 2.0);
    let reference = image.clone();
    let sumwt = array![[1.0]];

    normalize_image(&mut image, &sumwt, Some(&pb), NormKind::PbMultiply, PB_LIMIT).unwrap();
    normalize_image(&mut image, &sumwt, Some(&pb), NormKind::PbDivide, PB_LIMIT).unwrap();
    for y in 0..n {
        for x in 0..n {
            if pb[(y, x)] > PB_LIMIT {
                assert_abs_diff_eq!(image[(y, x, 0, 0)], reference[(y, x, 0, 0)], epsilon = 1e-12);
            } else {
                assert_abs_diff_eq!(image[(y, x, 0, 0)], 0.0);
            }
        }
    }

    // Sqrt variants compose the same way.
    let mut image = Array4::from_elem((n, n, 1, 1), 2.0);
    normalize_image(&mut image, &sumwt, Some(&pb), NormKind::PbSqrtMultiply, PB_LIMIT).unwrap();
    normalize_image(&mut image, &sumwt, Some(&pb), NormKind::PbSqrtDivide, PB_LIMIT).unwrap();
    for y in 0..n {
        for x in 0..n {
            if pb[(y, x)] > PB_LIMIT {
                assert_abs_diff_eq!(image[(y, x, 0, 0)], 2.0, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_normalize_pb_requires_beam() {
    let mut image = Array4::from_elem((4, 4, 1, 1), 1.0);
    let sumwt = array![[1.0]];
    assert!(matches!(
        normalize_image(&mut image, &sumwt, None, NormKind::PbDivide, PB_LIMIT),
        Err(BeamError::MissingAveragePb)
    ));
}

#[test]
fn test_average_pb_latch() {
    let mut corrector = PrimaryBeamCorrector::new(PB_LIMIT, None);
    assert!(corrector.avg_pb().is_none());

    let plane = gaussian_beam(8, 2.0) * 3.0;
    corrector.accumulate_pb(plane.view()).unwrap();
    corrector.accumulate_pb(plane.view()).unwrap();
    // Not visible until frozen.
    assert!(corrector.avg_pb().is_none());

    corrector.freeze_average_pb().unwrap();
    let pb = corrector.avg_pb().unwrap().clone();
    let peak = pb.iter().cloned().fold(f64::MIN, f64::max);
    assert_abs_diff_eq!(peak, 1.0, epsilon = 1e-12);

    // Frozen: further accumulation and freezing are no-ops.
    corrector.accumulate_pb((&plane * 100.0).view()).unwrap();
    corrector.freeze_average_pb().unwrap();
    assert_eq!(corrector.avg_pb().unwrap(), &pb);
}

#[test]
fn test_calculate_taylor_pbs_is_idempotent() {
    let mut corrector = ready_corrector(16);
    let first: Vec<Array2<f64>> = corrector.pb_coeffs().to_vec();
    assert!(corrector.done_pb_taylor());

    // A second pass with *different* inputs must not re-trigger anything.
    let junk = vec![Array2::ones((16, 16)); 3];
    corrector
        .calculate_taylor_pbs(&junk, &[9.0; 5], 3)
        .unwrap();
    let second: Vec<Array2<f64>> = corrector.pb_coeffs().to_vec();
    // Bit-identical.
    assert_eq!(first, second);
}

#[test]
fn test_taylor_pbs_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let pb = gaussian_beam(16, 4.0);
    let weight_images: Vec<_> = (0..2).map(|t| &pb * 0.5f64.powi(t)).collect();
    let sumweights = vec![4.0, 2.0, 1.5];

    let mut first = PrimaryBeamCorrector::new(PB_LIMIT, Some(dir.path().to_path_buf()));
    first
        .calculate_taylor_pbs(&weight_images, &sumweights, 2)
        .unwrap();
    let computed = first.pb_coeffs().to_vec();

    // A fresh corrector (a later major cycle) reloads from the cache even
    // when handed garbage weights.
    let mut second = PrimaryBeamCorrector::new(PB_LIMIT, Some(dir.path().to_path_buf()));
    let junk = vec![Array2::ones((16, 16)); 2];
    second.calculate_taylor_pbs(&junk, &sumweights, 2).unwrap();
    assert_eq!(second.pb_coeffs(), &computed[..]);
}

#[test]
fn test_apply_wide_band_pb_round_trip() {
    let n = 16;
    let corrector = ready_corrector(n);

    let mut images: Vec<Array2<f64>> = (0..3)
        .map(|t| Array2::from_elem((n, n), 1.0 + t as f64 * 0.3))
        .collect();
    let reference = images.clone();

    corrector
        .apply_wide_band_pb(PbAction::Divide, &mut images)
        .unwrap();
    corrector
        .apply_wide_band_pb(PbAction::Multiply, &mut images)
        .unwrap();

    let c0 = &corrector.pb_coeffs()[0];
    for t in 0..3 {
        for y in 0..n {
            for x in 0..n {
                let v = images[t][(y, x)];
                assert!(v.is_finite());
                if c0[(y, x)].abs() > PB_LIMIT {
                    assert_abs_diff_eq!(v, reference[t][(y, x)], epsilon = 1e-9);
                } else {
                    // Below the limit the outputs are forced to zero.
                    assert_abs_diff_eq!(v, 0.0);
                }
            }
        }
    }
}

#[test]
fn test_pb_limit_boundary_and_sweep() {
    // coeff_0 spanning [0, 10*pb_limit]: outputs are never NaN/Inf, and
    // the boundary pixel (exactly pb_limit) lands on the zeroed side.
    let n = 101;
    let mut corrector = PrimaryBeamCorrector::new(PB_LIMIT, None);
    let coeff0 = Array2::from_shape_fn((1, n), |(_, x)| x as f64 * 10.0 * PB_LIMIT / (n - 1) as f64);
    let weight_images = vec![coeff0.clone()];
    let sumweights = vec![1.0];
    corrector
        .calculate_taylor_pbs(&weight_images, &sumweights, 1)
        .unwrap();

    let mut images = vec![Array2::from_elem((1, n), 1.0)];
    corrector
        .apply_wide_band_pb(PbAction::Divide, &mut images)
        .unwrap();
    for x in 0..n {
        let v = images[0][(0, x)];
        assert!(v.is_finite(), "pixel {x} is {v}");
    }
    // x = 10 has coeff_0 == pb_limit exactly: strictly-greater keeps, so
    // this pixel must be zero.
    assert_abs_diff_eq!(images[0][(0, 10)], 0.0);
    // Just above the boundary: divided, finite, positive.
    assert!(images[0][(0, 11)] > 0.0);
}

#[test]
fn test_singular_hessian_fails_fast() {
    let n = 4;
    let mut corrector = PrimaryBeamCorrector::new(PB_LIMIT, None);
    // Identical coefficient planes make every per-pixel Toeplitz matrix
    // rank one.
    let plane = Array2::from_elem((n, n), 0.5);
    corrector.pb_coeffs = vec![plane.clone(), plane.clone()];
    corrector.done_pb_taylor = true;

    let mut images = vec![Array2::ones((n, n)), Array2::ones((n, n))];
    let result = corrector.apply_wide_band_pb(PbAction::Divide, &mut images);
    assert!(matches!(
        result,
        Err(BeamError::Math(crate::math::MathError::Singular { .. }))
    ));
}

#[test]
fn test_apply_before_calculate_is_an_error() {
    let corrector = PrimaryBeamCorrector::new(PB_LIMIT, None);
    let mut images = vec![Array2::ones((4, 4))];
    assert!(matches!(
        corrector.apply_wide_band_pb(PbAction::Divide, &mut images),
        Err(BeamError::CoefficientsNotReady)
    ));
}
