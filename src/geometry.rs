use nalgebra::{Point2, Vector2};
use smallvec::{smallvec, SmallVec};

/// Tolerance for degenerate configurations in screen space
pub const GEOMETRY_EPS: f64 = 1e-10;

/// A corner projected onto the screen, along with its eye-space depth
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectedPoint {
    pub screen: Point2<f64>,
    pub depth: f64,
}

impl ProjectedPoint {
    pub fn new(u: f64, v: f64, depth: f64) -> Self {
        Self {
            screen: Point2::new(u, v),
            depth,
        }
    }
}

/// Result of a mutual occlusion test between two primitives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occlusion {
    /// The first primitive covers part of the second
    FirstHides,
    /// The second primitive covers part of the first
    SecondHides,
    /// No overlap was found, or the depths were too close to decide
    Undetermined,
}

impl Occlusion {
    pub fn is_determined(&self) -> bool {
        !matches!(self, Self::Undetermined)
    }

    /// The same result with the roles of the two primitives exchanged
    pub fn flipped(self) -> Self {
        match self {
            Self::FirstHides => Self::SecondHides,
            Self::SecondHides => Self::FirstHides,
            Self::Undetermined => Self::Undetermined,
        }
    }

    // closer depth wins; differences within eps don't decide anything
    fn from_depths(first: f64, second: f64, eps: f64) -> Self {
        if first < second - eps {
            Self::FirstHides
        } else if second < first - eps {
            Self::SecondHides
        } else {
            Self::Undetermined
        }
    }
}

/// Axis-aligned bounding box in screen space
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenBox {
    pub u_min: f64,
    pub u_max: f64,
    pub v_min: f64,
    pub v_max: f64,
}

impl ScreenBox {
    /// An empty box which any point will extend
    pub fn empty() -> Self {
        Self {
            u_min: f64::INFINITY,
            u_max: f64::NEG_INFINITY,
            v_min: f64::INFINITY,
            v_max: f64::NEG_INFINITY,
        }
    }

    pub fn new(u_min: f64, u_max: f64, v_min: f64, v_max: f64) -> Self {
        Self {
            u_min,
            u_max,
            v_min,
            v_max,
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point2<f64>>) -> Self {
        points.into_iter().fold(Self::empty(), |mut bbox, p| {
            bbox.include(p);
            bbox
        })
    }

    pub fn include(&mut self, p: &Point2<f64>) {
        self.u_min = self.u_min.min(p.x);
        self.u_max = self.u_max.max(p.x);
        self.v_min = self.v_min.min(p.y);
        self.v_max = self.v_max.max(p.y);
    }

    /// Smallest box containing both boxes
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            u_min: self.u_min.min(other.u_min),
            u_max: self.u_max.max(other.u_max),
            v_min: self.v_min.min(other.v_min),
            v_max: self.v_max.max(other.v_max),
        }
    }

    /// Do the closed boxes share at least one point
    pub fn overlaps(&self, other: &Self) -> bool {
        self.u_min <= other.u_max
            && other.u_min <= self.u_max
            && self.v_min <= other.v_max
            && other.v_min <= self.v_max
    }

    /// Lower bound along an axis (0 = u, 1 = v)
    pub fn min(&self, axis: usize) -> f64 {
        if axis == 0 {
            self.u_min
        } else {
            self.v_min
        }
    }

    /// Upper bound along an axis (0 = u, 1 = v)
    pub fn max(&self, axis: usize) -> f64 {
        if axis == 0 {
            self.u_max
        } else {
            self.v_max
        }
    }
}

fn cross(a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Parametric intersection of the segments `p1-p2` and `p3-p4`
///
/// Returns `(alpha, beta)` with `p1 + alpha (p2 - p1) == p3 + beta (p4 - p3)` if the segments cross
/// strictly inside both (`0 < alpha < 1` and `0 < beta < 1`).
///
/// Zero-length segments, segments sharing an endpoint and parallel (or collinear) segments never intersect.
pub fn segment_intersection(
    p1: &Point2<f64>,
    p2: &Point2<f64>,
    p3: &Point2<f64>,
    p4: &Point2<f64>,
) -> Option<(f64, f64)> {
    let d1 = p2 - p1;
    let d2 = p4 - p3;

    if d1.norm() < GEOMETRY_EPS || d2.norm() < GEOMETRY_EPS {
        return None;
    }

    // shared edges of adjacent faces must not count as crossings
    for a in [p1, p2] {
        for b in [p3, p4] {
            if (a - b).norm() < GEOMETRY_EPS {
                return None;
            }
        }
    }

    let (alpha, beta) = match (d1.x.abs() < GEOMETRY_EPS, d2.x.abs() < GEOMETRY_EPS) {
        // both vertical
        (true, true) => return None,
        (true, false) => {
            let beta = (p1.x - p3.x) / d2.x;
            let y = p3.y + beta * d2.y;
            ((y - p1.y) / d1.y, beta)
        }
        (false, true) => {
            let alpha = (p3.x - p1.x) / d1.x;
            let y = p1.y + alpha * d1.y;
            (alpha, (y - p3.y) / d2.y)
        }
        (false, false) => {
            let denom = cross(&d1, &d2);
            if denom.abs() < GEOMETRY_EPS * d1.norm() * d2.norm() {
                return None;
            }
            let r = p3 - p1;
            (cross(&r, &d2) / denom, cross(&r, &d1) / denom)
        }
    };

    let inside = |t: f64| t > GEOMETRY_EPS && t < 1.0 - GEOMETRY_EPS;
    if inside(alpha) && inside(beta) {
        Some((alpha, beta))
    } else {
        None
    }
}

/// Is a point inside the closed polygon (points on the boundary count as inside)
pub fn point_in_polygon(polygon: &[Point2<f64>], p: &Point2<f64>) -> bool {
    let n = polygon.len();
    if n == 0 {
        return false;
    }

    // boundary
    for i in 0..n {
        let (a, b) = (&polygon[i], &polygon[(i + 1) % n]);
        let ab = b - a;
        let ap = p - a;
        let len_sq = ab.norm_squared();
        let t = if len_sq > 0.0 {
            (ap.dot(&ab) / len_sq).clamp(0.0, 1.0)
        } else {
            0.0
        };
        if (ap - ab * t).norm() < GEOMETRY_EPS {
            return true;
        }
    }

    // crossing number
    let mut inside = false;
    for i in 0..n {
        let (a, b) = (&polygon[i], &polygon[(i + 1) % n]);
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

// barycentric coordinates of p in a screen triangle (None if the triangle is degenerate)
fn barycentric(tri: &[ProjectedPoint; 3], p: &Point2<f64>) -> Option<[f64; 3]> {
    let v0 = tri[1].screen - tri[0].screen;
    let v1 = tri[2].screen - tri[0].screen;
    let v2 = p - tri[0].screen;

    let det = cross(&v0, &v1);
    if det.abs() < GEOMETRY_EPS {
        return None;
    }

    let l1 = cross(&v2, &v1) / det;
    let l2 = cross(&v0, &v2) / det;
    Some([1.0 - l1 - l2, l1, l2])
}

fn centroid(tri: &[ProjectedPoint; 3]) -> (Point2<f64>, f64) {
    let screen = Point2::from(
        (tri[0].screen.coords + tri[1].screen.coords + tri[2].screen.coords) / 3.0,
    );
    (screen, (tri[0].depth + tri[1].depth + tri[2].depth) / 3.0)
}

// compare the centroid of `inner` with the depth of `outer` at the same screen position
fn containment(outer: &[ProjectedPoint; 3], inner: &[ProjectedPoint; 3], eps: f64) -> Occlusion {
    let (c, c_depth) = centroid(inner);
    let outline = [outer[0].screen, outer[1].screen, outer[2].screen];
    if !point_in_polygon(&outline, &c) {
        return Occlusion::Undetermined;
    }
    match barycentric(outer, &c) {
        Some(lambda) => {
            let outer_depth = lambda
                .iter()
                .zip(outer.iter())
                .map(|(l, p)| l * p.depth)
                .sum::<f64>();
            Occlusion::from_depths(outer_depth, c_depth, eps)
        }
        _ => Occlusion::Undetermined,
    }
}

/// Decide which of two projected triangles covers the other
///
/// 1. At the first pair of crossing edges, the triangle with the smaller interpolated depth wins.
/// 2. Without crossings, if one triangle's centroid lies inside the other, their depths at that point are compared.
///
/// Depth differences within `eps` never decide; the search continues with the next candidate point.
pub fn compare_triangles(
    tri0: &[ProjectedPoint; 3],
    tri1: &[ProjectedPoint; 3],
    eps: f64,
) -> Occlusion {
    for i in 0..3 {
        let (a0, a1) = (&tri0[i], &tri0[(i + 1) % 3]);
        for j in 0..3 {
            let (b0, b1) = (&tri1[j], &tri1[(j + 1) % 3]);
            if let Some((alpha, beta)) =
                segment_intersection(&a0.screen, &a1.screen, &b0.screen, &b1.screen)
            {
                let z0 = a0.depth + alpha * (a1.depth - a0.depth);
                let z1 = b0.depth + beta * (b1.depth - b0.depth);
                let result = Occlusion::from_depths(z0, z1, eps);
                if result.is_determined() {
                    return result;
                }
            }
        }
    }

    let result = containment(tri0, tri1, eps);
    if result.is_determined() {
        return result;
    }
    containment(tri1, tri0, eps).flipped()
}

/// Split a planar face with 3 or 4 corners into triangles
pub fn triangulate(face: &[ProjectedPoint]) -> SmallVec<[[ProjectedPoint; 3]; 2]> {
    match face {
        [a, b, c] => smallvec![[*a, *b, *c]],
        [a, b, c, d] => smallvec![[*a, *b, *c], [*a, *c, *d]],
        _ => SmallVec::new(),
    }
}

/// Decide which of two projected faces (3 or 4 corners each) covers the other
///
/// Both faces are triangulated and all triangle pairs are tested; the first definite answer wins.
pub fn compare_quadrilaterals(
    face0: &[ProjectedPoint],
    face1: &[ProjectedPoint],
    eps: f64,
) -> Occlusion {
    let (tris0, tris1) = (triangulate(face0), triangulate(face1));
    for t0 in tris0.iter() {
        for t1 in tris1.iter() {
            let result = compare_triangles(t0, t1, eps);
            if result.is_determined() {
                return result;
            }
        }
    }
    Occlusion::Undetermined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64, y: f64) -> Point2<f64> {
        Point2::new(x, y)
    }

    #[test]
    fn crossing_diagonals() {
        let (alpha, beta) =
            segment_intersection(&p(0.0, 0.0), &p(1.0, 1.0), &p(0.0, 1.0), &p(1.0, 0.0)).unwrap();
        assert!((alpha - 0.5).abs() < 1e-14);
        assert!((beta - 0.5).abs() < 1e-14);
    }

    #[test]
    fn vertical_and_horizontal_segments() {
        let (alpha, beta) =
            segment_intersection(&p(0.5, 0.0), &p(0.5, 2.0), &p(0.0, 1.5), &p(2.0, 1.5)).unwrap();
        assert!((alpha - 0.75).abs() < 1e-14);
        assert!((beta - 0.25).abs() < 1e-14);

        let (alpha, beta) =
            segment_intersection(&p(0.0, 1.5), &p(2.0, 1.5), &p(0.5, 0.0), &p(0.5, 2.0)).unwrap();
        assert!((alpha - 0.25).abs() < 1e-14);
        assert!((beta - 0.75).abs() < 1e-14);

        // both vertical
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(0.0, 1.0), &p(1.0, 0.0), &p(1.0, 1.0)).is_none()
        );
    }

    #[test]
    fn non_intersecting_segments() {
        // collinear, disjoint
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(1.0, 1.0), &p(2.0, 2.0), &p(3.0, 3.0)).is_none()
        );
        // collinear, overlapping
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(2.0, 2.0), &p(1.0, 1.0), &p(3.0, 3.0)).is_none()
        );
        // shared endpoint
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(1.0, 1.0), &p(1.0, 1.0), &p(2.0, 0.0)).is_none()
        );
        // zero length
        assert!(
            segment_intersection(&p(0.5, 0.5), &p(0.5, 0.5), &p(0.0, 1.0), &p(1.0, 0.0)).is_none()
        );
        // crossing lines, but outside the second segment
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(1.0, 1.0), &p(0.0, 3.0), &p(1.0, 2.0)).is_none()
        );
        // touching at an interior point of one segment only
        assert!(
            segment_intersection(&p(0.0, 0.0), &p(2.0, 0.0), &p(1.0, 0.0), &p(1.0, 1.0)).is_none()
        );
    }

    #[test]
    fn polygon_containment() {
        let square = [p(0.0, 0.0), p(1.0, 0.0), p(1.0, 1.0), p(0.0, 1.0)];
        assert!(point_in_polygon(&square, &p(0.5, 0.5)));
        assert!(point_in_polygon(&square, &p(1.0, 0.5)));
        assert!(point_in_polygon(&square, &p(0.0, 0.0)));
        assert!(!point_in_polygon(&square, &p(1.5, 0.5)));
        assert!(!point_in_polygon(&square, &p(-0.1, 1.0)));

        let concave = [p(0.0, 0.0), p(2.0, 0.0), p(2.0, 2.0), p(1.0, 0.5), p(0.0, 2.0)];
        assert!(point_in_polygon(&concave, &p(0.5, 0.5)));
        assert!(!point_in_polygon(&concave, &p(1.0, 1.5)));
        assert!(!point_in_polygon(&[], &p(0.0, 0.0)));
    }

    fn flat_triangle(corners: [(f64, f64); 3], depth: f64) -> [ProjectedPoint; 3] {
        corners.map(|(u, v)| ProjectedPoint::new(u, v, depth))
    }

    #[test]
    fn crossing_triangles() {
        let near = flat_triangle([(0.0, 0.0), (2.0, 0.0), (0.0, 2.0)], 1.0);
        let far = flat_triangle([(1.0, -1.0), (3.0, 1.0), (1.0, 1.0)], 5.0);

        assert_eq!(compare_triangles(&near, &far, GEOMETRY_EPS), Occlusion::FirstHides);
        assert_eq!(compare_triangles(&far, &near, GEOMETRY_EPS), Occlusion::SecondHides);
    }

    #[test]
    fn nested_triangles() {
        let outer = flat_triangle([(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)], 4.0);
        let inner = flat_triangle([(1.0, 1.0), (2.0, 1.0), (1.0, 2.0)], 2.0);

        assert_eq!(compare_triangles(&outer, &inner, GEOMETRY_EPS), Occlusion::SecondHides);
        assert_eq!(compare_triangles(&inner, &outer, GEOMETRY_EPS), Occlusion::FirstHides);

        // centroid on the outer triangle's edge still counts as contained
        let on_edge = flat_triangle([(4.0, 0.0), (6.0, 0.0), (5.0, 0.0)], 2.0);
        assert_eq!(compare_triangles(&outer, &on_edge, GEOMETRY_EPS), Occlusion::SecondHides);

        // overlapping boxes, but the centroid lies past the hypotenuse
        let beyond = flat_triangle([(6.0, 6.0), (7.0, 6.0), (6.0, 7.0)], 2.0);
        assert_eq!(compare_triangles(&outer, &beyond, GEOMETRY_EPS), Occlusion::Undetermined);
    }

    #[test]
    fn undecided_triangles() {
        let a = flat_triangle([(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)], 1.0);
        let disjoint = flat_triangle([(5.0, 5.0), (6.0, 5.0), (5.0, 6.0)], 2.0);
        assert_eq!(compare_triangles(&a, &disjoint, GEOMETRY_EPS), Occlusion::Undetermined);

        // same depth everywhere: no decision
        let coplanar = flat_triangle([(0.5, -0.5), (1.5, 0.5), (0.2, 0.2)], 1.0);
        assert_eq!(compare_triangles(&a, &coplanar, GEOMETRY_EPS), Occlusion::Undetermined);
    }

    #[test]
    fn quadrilaterals() {
        let square = |offset: f64, depth: f64| {
            [
                ProjectedPoint::new(offset, offset, depth),
                ProjectedPoint::new(offset + 2.0, offset, depth),
                ProjectedPoint::new(offset + 2.0, offset + 2.0, depth),
                ProjectedPoint::new(offset, offset + 2.0, depth),
            ]
        };

        assert_eq!(
            compare_quadrilaterals(&square(0.0, 1.0), &square(1.0, 3.0), GEOMETRY_EPS),
            Occlusion::FirstHides
        );
        assert_eq!(
            compare_quadrilaterals(&square(0.0, 3.0), &square(1.0, 1.0)[..3], GEOMETRY_EPS),
            Occlusion::SecondHides
        );
        assert_eq!(
            compare_quadrilaterals(&square(0.0, 3.0), &square(5.0, 1.0), GEOMETRY_EPS),
            Occlusion::Undetermined
        );
        assert_eq!(triangulate(&square(0.0, 0.0)[..2]).len(), 0);
    }

    #[test]
    fn screen_boxes() {
        let a = ScreenBox::from_points(&[p(0.0, 0.0), p(1.0, 2.0)]);
        assert_eq!(a, ScreenBox::new(0.0, 1.0, 0.0, 2.0));
        assert!(a.overlaps(&ScreenBox::new(1.0, 3.0, 2.0, 4.0)));
        assert!(!a.overlaps(&ScreenBox::new(1.1, 3.0, 0.0, 4.0)));
        assert_eq!(
            a.merged(&ScreenBox::new(-1.0, 0.5, 3.0, 4.0)),
            ScreenBox::new(-1.0, 1.0, 0.0, 4.0)
        );
        assert_eq!(a.min(1), 0.0);
        assert_eq!(a.max(0), 1.0);
    }
}
