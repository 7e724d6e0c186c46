//! Great-circle distance math and proximity filtering.
//!
//! Pure functions, independent of any device or network API, so the radius
//! logic used by volunteer fan-out is unit-testable on its own.

/// Earth's mean radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in meters.
pub fn haversine_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// A candidate paired with its computed distance from a reference point.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked<T> {
    pub item: T,
    pub distance_m: f64,
}

/// Keep candidates within `radius_m` of `(lat, lng)`, sorted ascending by
/// distance. `position` extracts each candidate's coordinate.
pub fn within_radius<T>(
    candidates: Vec<T>,
    lat: f64,
    lng: f64,
    radius_m: f64,
    position: impl Fn(&T) -> (f64, f64),
) -> Vec<Ranked<T>> {
    let mut ranked: Vec<Ranked<T>> = candidates
        .into_iter()
        .filter_map(|item| {
            let (clat, clng) = position(&item);
            let distance_m = haversine_distance_m(lat, lng, clat, clng);
            (distance_m <= radius_m).then_some(Ranked { item, distance_m })
        })
        .collect();

    ranked.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    ranked
}
