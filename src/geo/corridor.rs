use super::{BoundingBox, Coordinate, EARTH_RADIUS_M};

/// A buffered polyline along a recipient's recent and predicted path
#[derive(Debug, Clone, PartialEq)]
pub struct Corridor {
    pub path: Vec<Coordinate>,
    pub radius_m: f64,
}

impl Corridor {
    pub fn new(path: Vec<Coordinate>, radius_m: f64) -> Self {
        Self { path, radius_m }
    }

    /// Distance from `point` to the nearest segment of the path
    pub fn distance_to(&self, point: &Coordinate) -> f64 {
        match self.path.as_slice() {
            [] => f64::INFINITY,
            [only] => only.distance_to(point),
            path => path
                .windows(2)
                .map(|seg| segment_distance(point, &seg[0], &seg[1]))
                .fold(f64::INFINITY, f64::min),
        }
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        self.distance_to(point) <= self.radius_m
    }

    /// Box covering the whole buffered corridor, for store prefiltering
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut iter = self.path.iter();
        let first = BoundingBox::around(iter.next()?, self.radius_m);
        Some(iter.fold(first, |acc, p| {
            acc.union(&BoundingBox::around(p, self.radius_m))
        }))
    }
}

/// Point-to-segment distance on a local equirectangular projection centred
/// on `a`. Accurate to well under a percent at corridor scales (a few km).
fn segment_distance(p: &Coordinate, a: &Coordinate, b: &Coordinate) -> f64 {
    let ref_lat = ((a.lat + b.lat) / 2.0).to_radians();
    let project = |c: &Coordinate| -> (f64, f64) {
        (
            a.lon_delta_to(c).to_radians() * ref_lat.cos() * EARTH_RADIUS_M,
            (c.lat - a.lat).to_radians() * EARTH_RADIUS_M,
        )
    };

    let (px, py) = project(p);
    let (ax, ay) = project(a);
    let (bx, by) = project(b);

    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    };

    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}
