use nalgebra::{Isometry3, Point2, Point3, Vector3};

/// Vectors shorter than this cannot be normalized
const NORMALIZE_EPS: f64 = 1e-12;
/// Points closer to the eye than this (along the view direction) are clamped during perspective division
const MIN_PERSPECTIVE_DEPTH: f64 = 1e-9;

/// Singular view configurations, detected before ordering is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("observer and target coincide; the view direction is undefined")]
    ObserverAtTarget,
    #[error("the up vector is parallel to the view direction")]
    UpParallelToView,
    #[error("the cut plane normal has zero length")]
    ZeroCutNormal,
    #[error("view parameters contain a non-finite value")]
    NonFinite,
}

/// A clipping plane used to reveal the interior of a Mesh
///
/// The half-space the normal points into is cut away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutPlane {
    pub point: Point3<f64>,
    pub normal: Vector3<f64>,
}

impl CutPlane {
    pub fn new(point: Point3<f64>, normal: Vector3<f64>) -> Self {
        Self { point, normal }
    }

    /// Signed distance of a point from the plane (positive on the removed side)
    pub fn signed_distance(&self, p: &Point3<f64>) -> f64 {
        (p - self.point).dot(&self.normal)
    }
}

/// Observer, target and cut: everything that determines the element order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewSpec {
    pub observer: Point3<f64>,
    pub target: Point3<f64>,
    /// Direction that appears vertical on the screen
    pub up: Vector3<f64>,
    /// Perspective (true) or parallel (false) projection
    pub perspective: bool,
    pub cut: Option<CutPlane>,
}

impl ViewSpec {
    pub fn new(observer: Point3<f64>, target: Point3<f64>, up: Vector3<f64>) -> Self {
        Self {
            observer,
            target,
            up,
            perspective: true,
            cut: None,
        }
    }

    pub fn parallel(mut self) -> Self {
        self.perspective = false;
        self
    }

    pub fn with_cut(mut self, cut: CutPlane) -> Self {
        self.cut = Some(cut);
        self
    }

    /// The key used to decide whether a new ordering pass is needed
    pub fn signature(&self) -> ViewSignature {
        let plane_midpoint = self.cut.map_or(self.target, |cut| cut.point);
        ViewSignature {
            observer: self.observer.coords.into(),
            target: self.target.coords.into(),
            plane_midpoint: plane_midpoint.coords.into(),
            cut_normal: self.cut.map(|cut| cut.normal.into()),
            perspective: self.perspective,
        }
    }

    /// Build the transformation for this view
    pub fn transform(&self) -> Result<ViewTransform, GeometryError> {
        ViewTransform::new(self)
    }
}

/// Cached view parameters, compared by exact equality
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewSignature {
    pub observer: [f64; 3],
    pub target: [f64; 3],
    pub plane_midpoint: [f64; 3],
    pub cut_normal: Option<[f64; 3]>,
    pub perspective: bool,
}

/// Maps 3D points onto the screen and into eye space
pub trait Projection: Sync {
    fn project_to_screen(&self, p: &Point3<f64>) -> Point2<f64>;

    /// Distance in front of the observer along the view direction (larger is farther away)
    fn eye_space_depth(&self, p: &Point3<f64>) -> f64;

    /// Unit vector from the observer towards the target
    fn view_direction(&self) -> Vector3<f64>;

    /// Direction from a point towards the eye: `observer - at` in perspective mode, `observer - target` in parallel mode
    fn eye_vector(&self, at: &Point3<f64>) -> Vector3<f64>;

    fn cut_plane(&self) -> Option<&CutPlane>;
}

/// Observer transformation built from a [`ViewSpec`]
#[derive(Debug, Clone)]
pub struct ViewTransform {
    spec: ViewSpec,
    view: Isometry3<f64>,
    direction: Vector3<f64>,
    focal_length: f64,
    cut: Option<CutPlane>,
}

impl ViewTransform {
    pub fn new(spec: &ViewSpec) -> Result<Self, GeometryError> {
        let finite = spec
            .observer
            .iter()
            .chain(spec.target.iter())
            .chain(spec.up.iter())
            .all(|c| c.is_finite());
        if !finite {
            return Err(GeometryError::NonFinite);
        }

        let to_target = spec.target - spec.observer;
        let direction = to_target
            .try_normalize(NORMALIZE_EPS)
            .ok_or(GeometryError::ObserverAtTarget)?;

        if spec
            .up
            .cross(&direction)
            .try_normalize(NORMALIZE_EPS)
            .is_none()
        {
            return Err(GeometryError::UpParallelToView);
        }

        let cut = match spec.cut {
            Some(cut) => Some(CutPlane::new(
                cut.point,
                cut.normal
                    .try_normalize(NORMALIZE_EPS)
                    .ok_or(GeometryError::ZeroCutNormal)?,
            )),
            None => None,
        };

        Ok(Self {
            spec: *spec,
            view: Isometry3::look_at_rh(&spec.observer, &spec.target, &spec.up),
            direction,
            focal_length: to_target.norm(),
            cut,
        })
    }

    pub fn spec(&self) -> &ViewSpec {
        &self.spec
    }
}

impl Projection for ViewTransform {
    fn project_to_screen(&self, p: &Point3<f64>) -> Point2<f64> {
        let eye = self.view.transform_point(p);
        if self.spec.perspective {
            let scale = self.focal_length / (-eye.z).max(MIN_PERSPECTIVE_DEPTH);
            Point2::new(eye.x * scale, eye.y * scale)
        } else {
            Point2::new(eye.x, eye.y)
        }
    }

    fn eye_space_depth(&self, p: &Point3<f64>) -> f64 {
        // the right-handed look-at transform views along -z
        -self.view.transform_point(p).z
    }

    fn view_direction(&self) -> Vector3<f64> {
        self.direction
    }

    fn eye_vector(&self, at: &Point3<f64>) -> Vector3<f64> {
        if self.spec.perspective {
            self.spec.observer - at
        } else {
            self.spec.observer - self.spec.target
        }
    }

    fn cut_plane(&self) -> Option<&CutPlane> {
        self.cut.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn above() -> ViewSpec {
        ViewSpec::new(
            Point3::new(0.5, 0.5, 10.0),
            Point3::new(0.5, 0.5, 0.0),
            Vector3::y(),
        )
    }

    #[test]
    fn depth_and_projection() {
        let transform = above().transform().unwrap();

        assert!((transform.eye_space_depth(&Point3::new(0.5, 0.5, 0.0)) - 10.0).abs() < 1e-12);
        assert!((transform.eye_space_depth(&Point3::new(0.0, 0.0, 1.0)) - 9.0).abs() < 1e-12);

        let center = transform.project_to_screen(&Point3::new(0.5, 0.5, 3.0));
        assert!(center.coords.norm() < 1e-12);

        // closer points spread further apart in perspective
        let near = transform.project_to_screen(&Point3::new(1.5, 0.5, 5.0));
        let far = transform.project_to_screen(&Point3::new(1.5, 0.5, 0.0));
        assert!(near.x.abs() > far.x.abs());
        assert!((far.x.abs() - 1.0).abs() < 1e-12);

        let parallel = above().parallel().transform().unwrap();
        let near = parallel.project_to_screen(&Point3::new(1.5, 0.5, 5.0));
        let far = parallel.project_to_screen(&Point3::new(1.5, 0.5, 0.0));
        assert!((near.x - far.x).abs() < 1e-12);

        assert!((transform.view_direction() - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-12);
        assert!((parallel.eye_vector(&Point3::new(7.0, 7.0, 7.0)) - Vector3::new(0.0, 0.0, 10.0)).norm() < 1e-12);
    }

    #[test]
    fn degenerate_views() {
        let mut spec = above();
        spec.target = spec.observer;
        assert_eq!(spec.transform().unwrap_err(), GeometryError::ObserverAtTarget);

        let mut spec = above();
        spec.up = Vector3::z();
        assert_eq!(spec.transform().unwrap_err(), GeometryError::UpParallelToView);

        let spec = above().with_cut(CutPlane::new(Point3::origin(), Vector3::zeros()));
        assert_eq!(spec.transform().unwrap_err(), GeometryError::ZeroCutNormal);

        let mut spec = above();
        spec.observer.x = f64::NAN;
        assert_eq!(spec.transform().unwrap_err(), GeometryError::NonFinite);
    }

    #[test]
    fn signatures() {
        let spec = above();
        assert_eq!(spec.signature(), above().signature());
        assert_eq!(spec.signature().plane_midpoint, [0.5, 0.5, 0.0]);

        let cut = spec.with_cut(CutPlane::new(Point3::new(0.0, 0.0, 0.5), Vector3::z()));
        assert_ne!(spec.signature(), cut.signature());
        assert_eq!(cut.signature().plane_midpoint, [0.0, 0.0, 0.5]);
        assert_ne!(spec.signature(), spec.parallel().signature());
    }
}
