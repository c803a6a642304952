//! Scalar numerical pieces used by the emission densities and the M-step.
//!
//! Everything here is plain `f64` math; callers are responsible for filtering
//! missing (NaN) observations before calling in.

use std::f64::consts::PI;

/// Natural log of the gamma function (Lanczos approximation, g = 7).
///
/// Accurate to ~1e-13 over the range used here (shape and observation
/// arguments are always positive and far from the poles).
pub fn ln_gamma(x: f64) -> f64 {
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        // reflection formula
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        return log_pi_over_sin - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Modified Bessel function of the first kind, order zero.
///
/// Power series; converges quickly for the kappa range a tracking fit
/// produces (kappa is capped well below 100 upstream).
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..200 {
        term *= (half / k as f64) * (half / k as f64);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

/// Log-density of a gamma distribution with shape `a` and rate `b` at `x > 0`.
pub fn gamma_logpdf(x: f64, a: f64, b: f64) -> f64 {
    a * b.ln() - ln_gamma(a) + (a - 1.0) * x.ln() - b * x
}

/// Log-density of a von Mises distribution with location `mu` and
/// concentration `kappa` at angle `x` (radians).
pub fn von_mises_logpdf(x: f64, mu: f64, kappa: f64) -> f64 {
    kappa * (x - mu).cos() - (2.0 * PI * bessel_i0(kappa)).ln()
}

/// Gamma shape/rate from a weighted mean and variance (moment matching).
///
/// Degenerate inputs (non-positive mean or variance) fall back to a broad
/// unit-mean gamma so the EM iteration can recover.
pub fn gamma_from_moments(mean: f64, var: f64) -> (f64, f64) {
    if !(mean > 0.0) || !(var > 0.0) {
        return (1.0, 1.0);
    }
    let shape = mean * mean / var;
    let rate = mean / var;
    (shape, rate)
}

/// Approximate inverse of A1(kappa) = I1(kappa)/I0(kappa): concentration from
/// the mean resultant length `r` in [0, 1). Fisher (1993) piecewise formula.
pub fn kappa_from_resultant(r: f64) -> f64 {
    let r = r.clamp(0.0, 0.999_999);
    if r < 0.53 {
        2.0 * r + r.powi(3) + 5.0 * r.powi(5) / 6.0
    } else if r < 0.85 {
        -0.4 + 1.39 * r + 0.43 / (1.0 - r)
    } else {
        1.0 / (r.powi(3) - 4.0 * r.powi(2) + 3.0 * r)
    }
}

/// Wrap an angle in radians to (-pi, pi].
pub fn wrap_angle(x: f64) -> f64 {
    let mut a = x % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ln_gamma_known_values() {
        // Gamma(1) = Gamma(2) = 1, Gamma(5) = 24, Gamma(0.5) = sqrt(pi)
        assert!((ln_gamma(1.0)).abs() < 1e-10);
        assert!((ln_gamma(2.0)).abs() < 1e-10);
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - 0.5 * PI.ln()).abs() < 1e-10);
    }

    #[test]
    fn bessel_i0_known_values() {
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-14);
        // Abramowitz & Stegun table values
        assert!((bessel_i0(1.0) - 1.266_065_877_752_008).abs() < 1e-10);
        assert!((bessel_i0(2.0) - 2.279_585_302_336_067).abs() < 1e-10);
    }

    #[test]
    fn gamma_logpdf_integrates_near_one() {
        // crude trapezoid over a wide support
        let (a, b) = (2.5, 0.7);
        let h = 1e-3;
        let mut sum = 0.0;
        let mut x = h;
        while x < 60.0 {
            sum += gamma_logpdf(x, a, b).exp() * h;
            x += h;
        }
        assert!((sum - 1.0).abs() < 1e-3, "integral={sum}");
    }

    #[test]
    fn von_mises_logpdf_integrates_near_one() {
        let (mu, kappa) = (0.8, 2.0);
        let n = 20_000;
        let h = 2.0 * PI / n as f64;
        let mut sum = 0.0;
        for i in 0..n {
            let x = -PI + (i as f64 + 0.5) * h;
            sum += von_mises_logpdf(x, mu, kappa).exp() * h;
        }
        assert!((sum - 1.0).abs() < 1e-6, "integral={sum}");
    }

    #[test]
    fn gamma_moments_roundtrip() {
        let (shape, rate) = gamma_from_moments(10.0, 25.0);
        assert!((shape / rate - 10.0).abs() < 1e-12);
        assert!((shape / (rate * rate) - 25.0).abs() < 1e-12);
        // degenerate input falls back rather than producing NaN
        let (s2, r2) = gamma_from_moments(0.0, -1.0);
        assert_eq!((s2, r2), (1.0, 1.0));
    }

    #[test]
    fn kappa_inverse_is_monotone() {
        let mut last = 0.0;
        for i in 1..99 {
            let r = i as f64 / 100.0;
            let k = kappa_from_resultant(r);
            assert!(k >= last, "r={r} k={k} last={last}");
            last = k;
        }
    }

    #[test]
    fn wrap_angle_range() {
        assert!((wrap_angle(2.0 * PI + 0.3) - 0.3).abs() < 1e-12);
        assert!((wrap_angle(-2.0 * PI - 0.3) + 0.3).abs() < 1e-12);
        assert!((wrap_angle(PI + 0.2) - (0.2 - PI)).abs() < 1e-12);
        assert!((wrap_angle(0.1) - 0.1).abs() < 1e-15);
        for i in -20..20 {
            let a = wrap_angle(i as f64 * 0.7);
            assert!(a > -PI - 1e-12 && a <= PI + 1e-12);
        }
    }

}
