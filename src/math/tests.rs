// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::f64::consts::{FRAC_PI_2, PI};

use approx::assert_abs_diff_eq;
use ndarray::array;

use super::*;

#[test]
fn test_next_even_composite() {
    // 100 * 1.2 -> 120 = 2^3 * 3 * 5.
    assert_eq!(next_even_composite(120), 120);
    assert_eq!(next_even_composite(121), 128);
    assert_eq!(next_even_composite(1), 2);
    assert_eq!(next_even_composite(7), 8);
    assert_eq!(next_even_composite(257), 270);
    for n in [3, 17, 100, 1000, 4097] {
        let c = next_even_composite(n);
        assert!(c >= n);
        assert_eq!(c % 2, 0);
        assert!(is_5_smooth(c));
    }
}

#[test]
fn test_cexp() {
    assert_abs_diff_eq!(cexp(PI).re, -1.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cexp(PI).im, 0.0, epsilon = 1e-15);
    assert_abs_diff_eq!(cexp(FRAC_PI_2).im, 1.0, epsilon = 1e-15);
}

#[test]
fn test_invert_lu() {
    let m = array![[4.0, 7.0], [2.0, 6.0]];
    let inv = invert_lu(&m).unwrap();
    assert_abs_diff_eq!(inv[(0, 0)], 0.6, epsilon = 1e-12);
    assert_abs_diff_eq!(inv[(0, 1)], -0.7, epsilon = 1e-12);
    assert_abs_diff_eq!(inv[(1, 0)], -0.2, epsilon = 1e-12);
    assert_abs_diff_eq!(inv[(1, 1)], 0.4, epsilon = 1e-12);

    // Asymmetric 3x3; check M * M^-1 = I.
    let m = array![[2.0, -1.0, 0.5], [1.0, 3.0, -2.0], [0.0, 1.0, 1.0]];
    let inv = invert_lu(&m).unwrap();
    let prod = m.dot(&inv);
    for i in 0..3 {
        for j in 0..3 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(prod[(i, j)], expected, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_invert_lu_singular() {
    let m = array![[1.0, 2.0], [2.0, 4.0]];
    let result = invert_lu(&m);
    assert!(matches!(result, Err(MathError::Singular { .. })));
    // The diagnostic must carry the offending matrix contents.
    match result {
        Err(MathError::Singular { matrix }) => assert_eq!(matrix, vec![1.0, 2.0, 2.0, 4.0]),
        _ => unreachable!(),
    }
}

#[test]
fn test_invert_spd() {
    let m = array![[4.0, 2.0], [2.0, 3.0]];
    let inv = invert_spd(&m).unwrap();
    let prod = m.dot(&inv);
    for i in 0..2 {
        for j in 0..2 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(prod[(i, j)], expected, epsilon = 1e-12);
        }
    }
    // Agrees with the general inversion.
    let lu = invert_lu(&m).unwrap();
    for (a, b) in inv.iter().zip(lu.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_invert_spd_rejects_indefinite() {
    let m = array![[1.0, 2.0], [2.0, 1.0]];
    assert!(matches!(invert_spd(&m), Err(MathError::NotPosDef { .. })));
}
