use crate::mesh::{element::ElementShape, MeshAccess};
use crate::view::{CutPlane, Projection};
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::fmt;

// signed distances within this band count as lying on the cut plane
const CUT_EPS: f64 = 1e-12;

/// One bit per face of an Element, set if the face points towards the observer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FaceMask(u8);

impl FaceMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, face: usize) {
        self.0 |= 1 << face;
    }

    pub fn contains(&self, face: usize) -> bool {
        face < 8 && self.0 & (1 << face) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Indices of the set faces in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..8).filter(move |face| self.contains(*face))
    }
}

impl fmt::Display for FaceMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:06b}", self.0)
    }
}

/// Position of an Element relative to the active cut plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CutRelation {
    /// Entirely on the removed side of the plane
    Front,
    /// Entirely on the kept side of the plane
    Behind,
    /// Cut by the plane
    Straddling,
}

/// Per-Element results of the visibility classification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementVisibility {
    pub faces: FaceMask,
    /// `None` when no cut plane is active
    pub cut: Option<CutRelation>,
    /// Corners sorted by signed distance to the cut plane (see [`order_code`])
    pub order_code: u32,
}

/// Centroid of a set of points
pub fn centroid(points: &[Point3<f64>]) -> Point3<f64> {
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Point3::from(sum / points.len().max(1) as f64)
}

/// Normal of a face computed from its corners taken in ascending Node id order
///
/// Both Elements sharing a face obtain the same vector (up to rounding), independent of how each
/// lists the face's corners.
fn canonical_normal(corners: &[Point3<f64>], node_ids: &[u64]) -> Vector3<f64> {
    let mut order: SmallVec<[usize; 4]> = (0..corners.len()).collect();
    order.sort_unstable_by_key(|i| node_ids[*i]);

    let a = corners[order[0]];
    let b = corners[order[1]];
    let c = corners[order[2]];
    (b - a).cross(&(c - a))
}

/// Determine which faces of an Element point towards the observer
///
/// A face is visible if its outward normal has a positive dot product with the eye vector at the
/// face's centroid. Faces seen exactly edge-on (within `eps`, relative to the vector lengths) are
/// claimed by the Element with the smaller id, so that two Elements sharing a face never both mark
/// it visible, and a face shared with a neighbor is marked visible by exactly one of them.
pub fn face_visibility<M: MeshAccess, P: Projection>(
    mesh: &M,
    elem: usize,
    projection: &P,
    eps: f64,
) -> FaceMask {
    let shape = mesh.shape(elem);
    let corners = mesh.corners(elem);
    let corner_ids = mesh.corner_ids(elem);
    let elem_centroid = centroid(&corners);
    let id = mesh.global_id(elem);

    let mut mask = FaceMask::empty();
    for (face_idx, face) in shape.faces().iter().enumerate() {
        let face_corners: SmallVec<[Point3<f64>; 4]> =
            face.iter().map(|c| corners[*c]).collect();
        let face_ids: SmallVec<[u64; 4]> = face.iter().map(|c| corner_ids[*c]).collect();

        let face_centroid = centroid(&face_corners);
        let mut normal = canonical_normal(&face_corners, &face_ids);
        if normal.dot(&(face_centroid - elem_centroid)) < 0.0 {
            normal = -normal;
        }

        let eye = projection.eye_vector(&face_centroid);
        let dot = normal.dot(&eye);
        let threshold = eps * normal.norm() * eye.norm();

        let visible = if dot > threshold {
            true
        } else if dot < -threshold {
            false
        } else {
            mesh.neighbor_across_face(elem, face_idx)
                .map_or(false, |neighbor| id < neighbor)
        };

        if visible {
            mask.set(face_idx);
        }
    }
    mask
}

/// Classify an Element's corners against a cut plane
pub fn cut_relation(corners: &[Point3<f64>], plane: &CutPlane) -> CutRelation {
    let (min, max) = corners
        .iter()
        .map(|p| plane.signed_distance(p))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), d| {
            (min.min(d), max.max(d))
        });

    if min < -CUT_EPS && max > CUT_EPS {
        CutRelation::Straddling
    } else if max > CUT_EPS {
        CutRelation::Front
    } else {
        CutRelation::Behind
    }
}

/// Pack the corner permutation that sorts corners by signed distance to a cut plane
///
/// The corner count is stored in the top 4 bits; the corner index at sorted position `k` occupies
/// bits `3k..3k+3`. Ties are broken by corner index.
pub fn order_code(corners: &[Point3<f64>], plane: &CutPlane) -> u32 {
    let mut order: SmallVec<[usize; 8]> = (0..corners.len()).collect();
    let distances: SmallVec<[f64; 8]> = corners.iter().map(|p| plane.signed_distance(p)).collect();
    order.sort_by(|a, b| distances[*a].total_cmp(&distances[*b]).then(a.cmp(b)));

    order
        .iter()
        .enumerate()
        .fold((corners.len() as u32) << 28, |code, (k, corner)| {
            code | (*corner as u32) << (3 * k)
        })
}

/// Unpack the corner permutation stored in a node-order code
pub fn decode_order_code(code: u32) -> SmallVec<[usize; 8]> {
    let n = ((code >> 28) as usize).min(8);
    (0..n).map(|k| ((code >> (3 * k)) & 0b111) as usize).collect()
}

/// The polygon in which a cut plane intersects an Element
///
/// Corners are visited in the order given by the node-order code; every edge joining a corner on the
/// kept side with one on the removed side contributes its intersection point. The points are returned
/// in angular order around their centroid. Fewer than 3 points means the Element isn't cut.
pub fn cut_polygon(
    shape: ElementShape,
    corners: &[Point3<f64>],
    plane: &CutPlane,
    code: u32,
) -> SmallVec<[Point3<f64>; 6]> {
    let distances: SmallVec<[f64; 8]> = corners.iter().map(|p| plane.signed_distance(p)).collect();

    // sorted position of each corner; positions below `split` lie on the kept side
    let order = decode_order_code(code);
    let mut rank = [0_usize; 8];
    for (k, corner) in order.iter().enumerate() {
        rank[*corner] = k;
    }
    let split = order
        .iter()
        .take_while(|corner| distances[**corner] <= CUT_EPS)
        .count();

    let mut points: SmallVec<[Point3<f64>; 6]> = SmallVec::new();
    for [a, b] in shape.edges() {
        if (rank[*a] < split) == (rank[*b] < split) {
            continue;
        }
        let (da, db) = (distances[*a], distances[*b]);
        let t = da / (da - db);
        let p = corners[*a] + (corners[*b] - corners[*a]) * t;
        if points.iter().all(|q| (q - p).norm() > CUT_EPS) {
            points.push(p);
        }
    }

    if points.len() < 3 {
        return SmallVec::new();
    }

    // angular sort within the plane
    let center = centroid(&points);
    let e1 = (points[0] - center).normalize();
    let e2 = plane.normal.cross(&e1);
    let angle = |p: &Point3<f64>| {
        let r = p - center;
        r.dot(&e2).atan2(r.dot(&e1))
    };
    points.sort_by(|p, q| angle(p).total_cmp(&angle(q)));
    points
}

/// Classify a single Element (visible faces, and cut relation and node-order code if a cut is active)
pub fn classify<M: MeshAccess, P: Projection>(
    mesh: &M,
    elem: usize,
    projection: &P,
    eps: f64,
) -> ElementVisibility {
    let faces = face_visibility(mesh, elem, projection, eps);
    match projection.cut_plane() {
        Some(plane) => {
            let corners = mesh.corners(elem);
            ElementVisibility {
                faces,
                cut: Some(cut_relation(&corners, plane)),
                order_code: order_code(&corners, plane),
            }
        }
        None => ElementVisibility {
            faces,
            cut: None,
            order_code: 0,
        },
    }
}

/// Classify a set of Elements in parallel (results are in the same order as `elems`)
pub fn classify_all<M: MeshAccess, P: Projection>(
    mesh: &M,
    elems: &[usize],
    projection: &P,
    eps: f64,
) -> Vec<ElementVisibility> {
    elems
        .par_iter()
        .map(|elem| classify(mesh, *elem, projection, eps))
        .collect()
}
