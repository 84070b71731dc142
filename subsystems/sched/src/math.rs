//! # Math Utilities for no_std
//!
//! Float helpers backed by libm so the scheduler core builds without `std`.

/// Square root
#[inline]
pub fn sqrt(x: f64) -> f64 {
    libm::sqrt(x)
}

/// Exponential e^x
#[inline]
pub fn exp(x: f64) -> f64 {
    libm::exp(x)
}

/// Absolute value
#[inline]
pub fn abs(x: f64) -> f64 {
    libm::fabs(x)
}

/// Round half away from zero
#[inline]
pub fn round(x: f64) -> f64 {
    libm::round(x)
}

/// Clamp into the unit interval, mapping NaN to zero
#[inline]
pub fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Arithmetic mean of a slice
pub fn mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

/// Population variance of a slice
pub fn variance(values: &[f32]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values
        .iter()
        .map(|&v| {
            let d = v as f64 - m;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_clamps_and_rejects_nan() {
        assert_eq!(unit(-0.5), 0.0);
        assert_eq!(unit(1.5), 1.0);
        assert_eq!(unit(f64::NAN), 0.0);
        assert_eq!(unit(0.25), 0.25);
    }

    #[test]
    fn test_mean_and_variance() {
        let values = [0.2f32, 0.4, 0.6, 0.8];
        assert!(abs(mean(&values) - 0.5) < 1e-6);
        assert!(abs(variance(&values) - 0.05) < 1e-6);
        assert_eq!(variance(&[0.7]), 0.0);
        assert_eq!(mean(&[]), 0.0);
    }
}
