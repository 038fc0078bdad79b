//! Lambert W function, real branches
//!
//! The per-bucket parameter optimization evaluates closed forms involving
//! the principal branch W0 and the secondary real branch W-1. Each
//! evaluation picks an initial estimate (branch-point series, rational
//! approximation, or asymptotic expansion depending on the argument) and
//! refines it with a single Fritsch iteration, which is accurate to about
//! 1e-15 near the estimate.
//!
//! The selection thresholds and polynomial coefficients must not be
//! altered: the optimizer floors the resulting quotients to integers, and
//! that flooring is sensitive to drift near the threshold crossings.

use std::f64::consts::{E, SQRT_2};

/// Evaluate the Lambert W function on branch `k` (0 or -1)
///
/// Returns NaN outside the real domain: `x < -1/e` on either branch, any
/// `x > 0` on the -1 branch, or an unsupported branch index. `W0(0) = 0`,
/// `W-1(0) = -inf`, `W(-1/e) = -1` on both branches, and `W0(+inf) = +inf`.
pub(crate) fn lambert_w(k: i32, x: f64) -> f64 {
    if !(-1..=0).contains(&k) || x < -1.0 / E || (k == -1 && x > 0.0) || x.is_nan() {
        return f64::NAN;
    }
    if x == 0.0 {
        return if k == 0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if x == -1.0 / E {
        return -1.0;
    }
    if x == f64::INFINITY {
        return x;
    }

    let w = initial(k, x);
    fritsch(w, x)
}

/// One Fritsch refinement step applied to the estimate `w`
fn fritsch(w: f64, x: f64) -> f64 {
    let z = (x / w).ln() - w;
    let w1 = w + 1.0;
    let q = 2.0 * w1 * (w1 + 2.0 * z / 3.0);
    let eps = z / w1 * (q - z) / (q - 2.0 * z);
    w * (1.0 + eps)
}

/// Initial estimate selection per branch and argument range
fn initial(k: i32, x: f64) -> f64 {
    match k {
        0 => {
            const XBRANCH: f64 = -0.32358170806015724;
            const XRATP0: f64 = 0.14546954290661823;
            const XRATP1: f64 = 8.706658967856612;
            if x < XBRANCH {
                branch_point(k, x)
            } else if x < XRATP0 {
                rational_p0(x)
            } else if x < XRATP1 {
                rational_p1(x)
            } else {
                asymptotic(k, x)
            }
        }
        _ => {
            // k = -1
            const XBRANCH: f64 = -0.30298541769;
            if x < XBRANCH {
                branch_point(k, x)
            } else {
                rational_m(x)
            }
        }
    }
}

/// Series estimate around the branch point -1/e
fn branch_point(k: i32, x: f64) -> f64 {
    let s = f64::from(1 + 2 * k);
    let p = s * SQRT_2 * (1.0 + E * x).sqrt();

    const B0: f64 = -1.0;
    const B1: f64 = 1.0;
    const B2: f64 = -0.3333333333333333;
    const B3: f64 = 0.1527777777777778;
    const B4: f64 = -0.07962962962962963;
    const B5: f64 = 0.04450231481481481;
    const B6: f64 = -0.02598471487360376;
    const B7: f64 = 0.01563563253233392;
    const B8: f64 = -0.009616892024299432;
    const B9: f64 = 0.006014543252956118;

    B0 + p * (B1 + p * (B2 + p * (B3 + p * (B4 + p * (B5 + p * (B6 + p * (B7 + p * (B8 + p * B9))))))))
}

/// Rational (4/4) estimate for W0 on the lower positive range
fn rational_p0(x: f64) -> f64 {
    const A0: f64 = 1.0;
    const A1: f64 = 5.931375839364438;
    const A2: f64 = 11.39220550532913;
    const A3: f64 = 7.33888339911111;
    const A4: f64 = 0.653449016991959;

    const B0: f64 = 1.0;
    const B1: f64 = 6.931373689597704;
    const B2: f64 = 16.82349461388016;
    const B3: f64 = 16.43072324143226;
    const B4: f64 = 5.115235195211697;

    let num = A0 + x * (A1 + x * (A2 + x * (A3 + x * A4)));
    let den = B0 + x * (B1 + x * (B2 + x * (B3 + x * B4)));
    x * num / den
}

/// Rational (4/4) estimate for W0 on the middle positive range
fn rational_p1(x: f64) -> f64 {
    const A0: f64 = 1.0;
    const A1: f64 = 2.445053070726557;
    const A2: f64 = 1.343664225958226;
    const A3: f64 = 0.148440055397592;
    const A4: f64 = 0.0008047501729130;

    const B0: f64 = 1.0;
    const B1: f64 = 3.444708986486002;
    const B2: f64 = 3.292489857371952;
    const B3: f64 = 0.916460018803122;
    const B4: f64 = 0.0530686404483322;

    let num = A0 + x * (A1 + x * (A2 + x * (A3 + x * A4)));
    let den = B0 + x * (B1 + x * (B2 + x * (B3 + x * B4)));
    x * num / den
}

/// Rational (2/5) estimate for W-1 near zero
fn rational_m(x: f64) -> f64 {
    const A0: f64 = -7.81417672390744;
    const A1: f64 = 253.88810188892484;
    const A2: f64 = 657.9493176902304;

    const B0: f64 = 1.0;
    const B1: f64 = -60.43958713690808;
    const B2: f64 = 99.9856708310761;
    const B3: f64 = 682.6073999909428;
    const B4: f64 = 962.1784396969866;
    const B5: f64 = 1477.9341280760887;

    (A0 + x * (A1 + x * A2)) / (B0 + x * (B1 + x * (B2 + x * (B3 + x * (B4 + x * B5)))))
}

/// Asymptotic estimate for large arguments
fn asymptotic(k: i32, x: f64) -> f64 {
    let s = f64::from(1 + 2 * k);
    let a = (s * x).ln();
    let b = (s * a).ln();

    let ba = b / a;
    let b2 = b * b;
    let b3 = b2 * b;
    let b4 = b2 * b2;

    let q0 = b - 2.0;
    let q1 = 2.0 * b2 - 9.0 * b + 6.0;
    let q2 = 3.0 * b3 - 22.0 * b2 + 36.0 * b - 12.0;
    let q3 = 12.0 * b4 - 125.0 * b3 + 350.0 * b2 - 300.0 * b + 60.0;
    a - b + ba * (1.0 + 1.0 / (2.0 * a) * (q0 + 1.0 / (3.0 * a) * (q1 + 1.0 / (2.0 * a) * (q2 + 1.0 / (5.0 * a) * q3))))
}
