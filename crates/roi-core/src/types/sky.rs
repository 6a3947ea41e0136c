//! Sky positions.

use serde::{Deserialize, Serialize};

/// Right ascension of the north galactic pole (J2000, degrees).
const RA_NGP: f64 = 192.859_48;
/// Declination of the north galactic pole (J2000, degrees).
const DEC_NGP: f64 = 27.128_25;
/// Galactic longitude of the north celestial pole (degrees).
const L_NCP: f64 = 122.931_92;

/// Coordinate system of a sky position or ROI projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordSys {
    /// Celestial (equatorial J2000) coordinates.
    #[default]
    Cel,
    /// Galactic coordinates.
    Gal,
}

/// A direction on the sky in celestial J2000 coordinates (degrees).
///
/// # Examples
///
/// ```
/// use roi_core::SkyDir;
///
/// let a = SkyDir::new(166.1, 38.2);
/// let b = SkyDir::new(166.1, 40.2);
/// assert!((a.separation(&b) - 2.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyDir {
    /// Right ascension in degrees.
    pub ra: f64,
    /// Declination in degrees.
    pub dec: f64,
}

impl SkyDir {
    /// Creates a sky direction from celestial coordinates in degrees.
    #[inline]
    #[must_use]
    pub const fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Creates a sky direction from galactic longitude/latitude in degrees.
    #[must_use]
    pub fn from_galactic(glon: f64, glat: f64) -> Self {
        let (sin_b, cos_b) = glat.to_radians().sin_cos();
        let (sin_d, cos_d) = DEC_NGP.to_radians().sin_cos();
        let (sin_dl, cos_dl) = (L_NCP - glon).to_radians().sin_cos();

        let dec = (sin_b * sin_d + cos_b * cos_d * cos_dl).clamp(-1.0, 1.0).asin();
        let ra = RA_NGP.to_radians()
            + (cos_b * sin_dl).atan2(sin_b * cos_d - cos_b * sin_d * cos_dl);

        Self {
            ra: wrap_degrees(ra.to_degrees()),
            dec: dec.to_degrees(),
        }
    }

    /// Returns `(glon, glat)` in degrees.
    #[must_use]
    pub fn to_galactic(&self) -> (f64, f64) {
        let (sin_dec, cos_dec) = self.dec.to_radians().sin_cos();
        let (sin_d, cos_d) = DEC_NGP.to_radians().sin_cos();
        let (sin_da, cos_da) = (self.ra - RA_NGP).to_radians().sin_cos();

        let glat = (sin_dec * sin_d + cos_dec * cos_d * cos_da).clamp(-1.0, 1.0).asin();
        let glon = L_NCP.to_radians()
            - (cos_dec * sin_da).atan2(sin_dec * cos_d - cos_dec * sin_d * cos_da);

        (wrap_degrees(glon.to_degrees()), glat.to_degrees())
    }

    /// Great-circle separation from `other` in degrees.
    ///
    /// Uses the haversine form, which stays accurate for the small
    /// separations typical inside an ROI.
    #[must_use]
    pub fn separation(&self, other: &Self) -> f64 {
        let dec1 = self.dec.to_radians();
        let dec2 = other.dec.to_radians();
        let half_ddec = (dec2 - dec1) / 2.0;
        let half_dra = (other.ra - self.ra).to_radians() / 2.0;

        let hav = half_ddec.sin().powi(2) + dec1.cos() * dec2.cos() * half_dra.sin().powi(2);
        (2.0 * hav.clamp(0.0, 1.0).sqrt().asin()).to_degrees()
    }

    /// Longitude and latitude in degrees in `coordsys`.
    #[must_use]
    pub fn lon_lat(&self, coordsys: CoordSys) -> (f64, f64) {
        match coordsys {
            CoordSys::Cel => (self.ra, self.dec),
            CoordSys::Gal => self.to_galactic(),
        }
    }

    /// Gnomonic (tangent-plane) offset `(x, y)` in degrees from `center`,
    /// with axes along increasing longitude and latitude of `coordsys`.
    ///
    /// `None` for directions 90 degrees or more from `center`, which have no
    /// tangent-plane image.
    #[must_use]
    pub fn tangent_offset(&self, center: &Self, coordsys: CoordSys) -> Option<(f64, f64)> {
        let (lon, lat) = self.lon_lat(coordsys);
        let (lon0, lat0) = center.lon_lat(coordsys);
        let (sin_b, cos_b) = lat.to_radians().sin_cos();
        let (sin_b0, cos_b0) = lat0.to_radians().sin_cos();
        let (sin_dl, cos_dl) = (lon - lon0).to_radians().sin_cos();

        let cos_c = sin_b0 * sin_b + cos_b0 * cos_b * cos_dl;
        if cos_c <= 0.0 {
            return None;
        }
        let x = cos_b * sin_dl / cos_c;
        let y = (cos_b0 * sin_b - sin_b0 * cos_b * cos_dl) / cos_c;
        Some((x.to_degrees(), y.to_degrees()))
    }
}

fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separation_zero() {
        let dir = SkyDir::new(83.63, 22.01);
        assert!(dir.separation(&dir).abs() < 1e-12);
    }

    #[test]
    fn test_separation_across_ra_wrap() {
        let a = SkyDir::new(359.5, 0.0);
        let b = SkyDir::new(0.5, 0.0);
        assert!((a.separation(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_separation_poles() {
        let north = SkyDir::new(0.0, 90.0);
        let south = SkyDir::new(120.0, -90.0);
        assert!((north.separation(&south) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_galactic_center() {
        let gc = SkyDir::from_galactic(0.0, 0.0);
        assert!((gc.ra - 266.405).abs() < 0.01, "ra = {}", gc.ra);
        assert!((gc.dec + 28.936).abs() < 0.01, "dec = {}", gc.dec);
    }

    #[test]
    fn test_galactic_round_trip() {
        let dir = SkyDir::new(166.1, 38.2);
        let (glon, glat) = dir.to_galactic();
        let back = SkyDir::from_galactic(glon, glat);
        assert!(dir.separation(&back) < 1e-8);
    }

    #[test]
    fn test_tangent_offset_axes() {
        let center = SkyDir::new(166.1, 38.2);
        assert_eq!(center.tangent_offset(&center, CoordSys::Cel), Some((0.0, 0.0)));

        let (x, y) = SkyDir::new(166.1, 40.2).tangent_offset(&center, CoordSys::Cel).unwrap();
        assert!(x.abs() < 1e-12);
        assert!((y - 2.0_f64.to_radians().tan().to_degrees()).abs() < 1e-9, "y = {y}");

        let (x, _) = SkyDir::new(167.1, 38.2).tangent_offset(&center, CoordSys::Cel).unwrap();
        assert!(x > 0.0 && x < 1.0, "x = {x}");
    }

    #[test]
    fn test_tangent_offset_far_hemisphere() {
        let center = SkyDir::new(0.0, 0.0);
        assert_eq!(SkyDir::new(180.0, 0.0).tangent_offset(&center, CoordSys::Cel), None);
        assert_eq!(SkyDir::new(120.0, 0.0).tangent_offset(&center, CoordSys::Gal), None);
    }

    #[test]
    fn test_tangent_offset_galactic_frame() {
        let center = SkyDir::from_galactic(10.0, 0.0);
        let dir = SkyDir::from_galactic(10.0, 1.5);
        let (x, y) = dir.tangent_offset(&center, CoordSys::Gal).unwrap();
        assert!(x.abs() < 1e-9, "x = {x}");
        assert!((y - 1.5_f64.to_radians().tan().to_degrees()).abs() < 1e-9, "y = {y}");
        let (xc, yc) = dir.tangent_offset(&center, CoordSys::Cel).unwrap();
        assert!(xc.abs() > 0.1 && yc.abs() > 0.1);
    }

    #[test]
    fn test_coordsys_serialization() {
        assert_eq!(serde_json::to_string(&CoordSys::Gal).unwrap(), r#""gal""#);
    }
}
