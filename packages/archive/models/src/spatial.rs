//! Sky-position math for footprint containment.
//!
//! A record's sky footprint (one detector quadrant) is approximated by
//! a small circle around its center coordinates; containment is an
//! exact great-circle separation test against that radius.

/// Angular radius in degrees covering one detector quadrant footprint.
///
/// A quadrant is roughly 0.85 x 0.85 degrees on the sky; 0.6 degrees is
/// its circumradius, so a point within this separation of a quadrant
/// center can fall on the quadrant.
pub const QUADRANT_RADIUS_DEG: f64 = 0.6;

/// Great-circle separation between two sky positions, in degrees.
///
/// Uses the haversine form, which is numerically stable for the small
/// separations footprint tests care about.
#[must_use]
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1) = (ra1.to_radians(), dec1.to_radians());
    let (ra2, dec2) = (ra2.to_radians(), dec2.to_radians());

    let sin_ddec = ((dec2 - dec1) / 2.0).sin();
    let sin_dra = ((ra2 - ra1) / 2.0).sin();
    let h = sin_ddec.mul_add(sin_ddec, dec1.cos() * dec2.cos() * sin_dra * sin_dra);

    (2.0 * h.sqrt().clamp(-1.0, 1.0).asin()).to_degrees()
}

/// `true` if the point `(ra, dec)` lies within `radius_deg` of the
/// footprint center `(center_ra, center_dec)`.
#[must_use]
pub fn footprint_contains(
    center_ra: f64,
    center_dec: f64,
    ra: f64,
    dec: f64,
    radius_deg: f64,
) -> bool {
    angular_separation_deg(center_ra, center_dec, ra, dec) <= radius_deg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separation_of_identical_points_is_zero() {
        assert!(angular_separation_deg(120.5, -30.2, 120.5, -30.2) < 1e-12);
    }

    #[test]
    fn separation_along_equator_matches_ra_difference() {
        let sep = angular_separation_deg(10.0, 0.0, 11.0, 0.0);
        assert!((sep - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ra_difference_shrinks_with_declination() {
        // At dec 60 a degree of RA is half a degree on the sky.
        let sep = angular_separation_deg(10.0, 60.0, 11.0, 60.0);
        assert!((sep - 0.5).abs() < 1e-3);
    }

    #[test]
    fn separation_across_ra_wrap() {
        let sep = angular_separation_deg(359.8, 0.0, 0.2, 0.0);
        assert!((sep - 0.4).abs() < 1e-9);
    }

    #[test]
    fn pole_to_pole_is_180() {
        let sep = angular_separation_deg(0.0, 90.0, 180.0, -90.0);
        assert!((sep - 180.0).abs() < 1e-9);
    }

    #[test]
    fn footprint_containment_uses_radius() {
        assert!(footprint_contains(100.0, 20.0, 100.3, 20.0, QUADRANT_RADIUS_DEG));
        assert!(!footprint_contains(100.0, 20.0, 101.0, 20.0, QUADRANT_RADIUS_DEG));
    }
}
