//! Small numeric helpers.

/// Round `v` to `decimals` places, half away from zero.
#[inline]
pub fn round_to(v: f64, decimals: u32) -> f64 {
    let p = 10f64.powi(decimals.min(15) as i32);
    (v * p).round() / p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_to(15.2404, 3), 15.24);
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
        assert_eq!(round_to(1234.5678, 1), 1234.6);
    }
}
