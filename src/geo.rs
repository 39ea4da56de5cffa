//! Geographic proximity helpers.

/// Earth radius in km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points in km.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin() * (dlat / 2.0).sin()
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin() * (dlon / 2.0).sin();
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_same_point() {
        assert!(haversine_km(-6.2, 106.8, -6.2, 106.8) < 1e-9);
    }

    #[test]
    fn jakarta_to_bandung_is_about_120km() {
        // Jakarta (-6.2088, 106.8456) to Bandung (-6.9175, 107.6191)
        let d = haversine_km(-6.2088, 106.8456, -6.9175, 107.6191);
        assert!(d > 110.0 && d < 135.0, "got {d}");
    }

    #[test]
    fn sub_threshold_point_stays_under_50km() {
        // ~0.4 degrees latitude is ~44km
        let d = haversine_km(-6.2, 106.8, -6.6, 106.8);
        assert!(d < 50.0, "got {d}");
    }
}
