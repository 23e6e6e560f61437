use crate::mesh::MeshAccess;
use crate::ordering::OrderedMesh;
use crate::view::Projection;
use crate::visibility::{centroid, cut_polygon, CutRelation};
use nalgebra::Point2;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Opaque color handle, interpreted by the [`Rasterizer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorIndex(pub u16);

/// A primitive 2D drawing operation
#[derive(Clone, Debug, PartialEq)]
pub enum DrawingInstruction {
    Line {
        from: Point2<f64>,
        to: Point2<f64>,
        color: ColorIndex,
    },
    /// A filled polygon
    Polygon {
        corners: SmallVec<[Point2<f64>; 6]>,
        color: ColorIndex,
    },
    /// A filled polygon with one color per corner
    ShadedPolygon {
        corners: SmallVec<[Point2<f64>; 6]>,
        colors: SmallVec<[ColorIndex; 6]>,
    },
    Text {
        at: Point2<f64>,
        text: String,
        color: ColorIndex,
    },
    Marker {
        at: Point2<f64>,
        color: ColorIndex,
    },
}

/// Executes drawing instructions (screen output is up to the implementor)
pub trait Rasterizer {
    fn line(&mut self, from: &Point2<f64>, to: &Point2<f64>, color: ColorIndex);

    fn polygon(&mut self, corners: &[Point2<f64>], color: ColorIndex);

    fn shaded_polygon(&mut self, corners: &[Point2<f64>], colors: &[ColorIndex]);

    fn text(&mut self, at: &Point2<f64>, text: &str, color: ColorIndex);

    fn marker(&mut self, at: &Point2<f64>, color: ColorIndex);
}

/// Pass every instruction of a stream to a rasterizer, returning the number of instructions executed
pub fn execute<R: Rasterizer>(
    stream: impl IntoIterator<Item = DrawingInstruction>,
    rasterizer: &mut R,
) -> usize {
    let mut count = 0;
    for instruction in stream {
        match &instruction {
            DrawingInstruction::Line { from, to, color } => rasterizer.line(from, to, *color),
            DrawingInstruction::Polygon { corners, color } => rasterizer.polygon(corners, *color),
            DrawingInstruction::ShadedPolygon { corners, colors } => {
                rasterizer.shaded_polygon(corners, colors)
            }
            DrawingInstruction::Text { at, text, color } => rasterizer.text(at, text, *color),
            DrawingInstruction::Marker { at, color } => rasterizer.marker(at, *color),
        }
        count += 1;
    }
    count
}

/// The order in which a plot visits Elements
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Traversal {
    /// Every Element, by plot position
    PlotOrder,
    /// Every Element, in the Mesh's own order
    Enumeration,
    /// Elements on one refinement level, by plot position
    Level(u8),
    /// Elements without sons, by plot position
    Leaves,
}

impl Traversal {
    /// Local Element indices in traversal order
    pub fn walk<'a, M: MeshAccess>(
        &self,
        ordered: &'a OrderedMesh<M>,
    ) -> impl Iterator<Item = usize> + 'a {
        let mesh = ordered.mesh();
        let elements = match self {
            Self::Enumeration => (0..mesh.num_elements()).collect(),
            _ => ordered.plot_order(),
        };
        let traversal = *self;
        elements.into_iter().filter(move |elem| match traversal {
            Self::PlotOrder | Self::Enumeration => true,
            Self::Level(level) => mesh.level(*elem) == level,
            Self::Leaves => mesh.sons(*elem).is_empty(),
        })
    }
}

/// Colors used by a [`GridPlot`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlotColors {
    pub fill: ColorIndex,
    pub outline: ColorIndex,
    pub cut: ColorIndex,
    pub text: ColorIndex,
    pub marker: ColorIndex,
}

impl Default for PlotColors {
    fn default() -> Self {
        Self {
            fill: ColorIndex(0),
            outline: ColorIndex(1),
            cut: ColorIndex(2),
            text: ColorIndex(3),
            marker: ColorIndex(4),
        }
    }
}

/// What a [`GridPlot`] draws for each Element
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlotOptions {
    pub traversal: Traversal,
    pub fill: bool,
    /// Fill with [`DrawingInstruction::ShadedPolygon`] instead of flat polygons
    pub shaded: bool,
    pub outline: bool,
    pub element_ids: bool,
    pub corner_markers: bool,
    pub colors: PlotColors,
}

impl Default for PlotOptions {
    fn default() -> Self {
        Self {
            traversal: Traversal::Leaves,
            fill: true,
            shaded: false,
            outline: true,
            element_ids: false,
            corner_markers: false,
            colors: PlotColors::default(),
        }
    }
}

/// Lazily produces the drawing instructions of a Mesh plot, Element by Element
///
/// For each Element (skipping those removed by the cut plane): its visible faces, filled and/or
/// outlined, the section of the cut plane if it is cut, then its id and corner markers.
pub struct GridPlot<'a, M: MeshAccess, P: Projection> {
    ordered: &'a OrderedMesh<M>,
    projection: &'a P,
    options: PlotOptions,
    elements: std::vec::IntoIter<usize>,
    pending: VecDeque<DrawingInstruction>,
}

impl<'a, M: MeshAccess, P: Projection> GridPlot<'a, M, P> {
    /// A plot of an ordered Mesh; `projection` should be the view the Mesh was ordered for
    pub fn new(ordered: &'a OrderedMesh<M>, projection: &'a P, options: PlotOptions) -> Self {
        let elements: Vec<usize> = options.traversal.walk(ordered).collect();
        Self {
            ordered,
            projection,
            options,
            elements: elements.into_iter(),
            pending: VecDeque::new(),
        }
    }

    fn emit_element(&mut self, elem: usize) {
        let ordered = self.ordered;
        let projection = self.projection;
        let mesh = ordered.mesh();
        let annotation = match ordered.annotation(elem) {
            Some(annotation) => *annotation,
            None => return,
        };
        if annotation.cut == Some(CutRelation::Front) {
            return;
        }

        let shape = mesh.shape(elem);
        let corners = mesh.corners(elem);
        let screen: SmallVec<[Point2<f64>; 8]> = corners
            .iter()
            .map(|p| projection.project_to_screen(p))
            .collect();
        let colors = self.options.colors;
        let plane = projection.cut_plane();

        for face_idx in annotation.faces.iter() {
            let face = shape.face(face_idx);

            // parts of cut Elements beyond the plane are replaced by the section
            if annotation.cut == Some(CutRelation::Straddling) {
                if let Some(plane) = plane {
                    if face.iter().any(|c| plane.signed_distance(&corners[*c]) > 0.0) {
                        continue;
                    }
                }
            }

            let face_corners: SmallVec<[Point2<f64>; 6]> =
                face.iter().map(|c| screen[*c]).collect();
            if self.options.fill {
                self.pending.push_back(if self.options.shaded {
                    DrawingInstruction::ShadedPolygon {
                        colors: SmallVec::from_elem(colors.fill, face_corners.len()),
                        corners: face_corners.clone(),
                    }
                } else {
                    DrawingInstruction::Polygon {
                        corners: face_corners.clone(),
                        color: colors.fill,
                    }
                });
            }
            if self.options.outline {
                for i in 0..face_corners.len() {
                    self.pending.push_back(DrawingInstruction::Line {
                        from: face_corners[i],
                        to: face_corners[(i + 1) % face_corners.len()],
                        color: colors.outline,
                    });
                }
            }
        }

        if let (Some(CutRelation::Straddling), Some(plane)) = (annotation.cut, plane) {
            let section = cut_polygon(shape, &corners, plane, annotation.order_code);
            if !section.is_empty() {
                self.pending.push_back(DrawingInstruction::Polygon {
                    corners: section
                        .iter()
                        .map(|p| projection.project_to_screen(p))
                        .collect(),
                    color: colors.cut,
                });
            }
        }

        if self.options.element_ids {
            self.pending.push_back(DrawingInstruction::Text {
                at: projection.project_to_screen(&centroid(&corners)),
                text: mesh.global_id(elem).to_string(),
                color: colors.text,
            });
        }
        if self.options.corner_markers {
            self.pending
                .extend(screen.iter().map(|at| DrawingInstruction::Marker {
                    at: *at,
                    color: colors.marker,
                }));
        }
    }
}

impl<'a, M: MeshAccess, P: Projection> Iterator for GridPlot<'a, M, P> {
    type Item = DrawingInstruction;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(instruction) = self.pending.pop_front() {
                return Some(instruction);
            }
            let elem = self.elements.next()?;
            self.emit_element(elem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::tests::two_hex_mesh;
    use crate::view::{CutPlane, ViewSpec};
    use nalgebra::{Point3, Vector3};

    #[derive(Default)]
    struct Recorder {
        lines: usize,
        polygons: Vec<(usize, ColorIndex)>,
        shaded: usize,
        labels: Vec<String>,
        markers: usize,
    }

    impl Rasterizer for Recorder {
        fn line(&mut self, _: &Point2<f64>, _: &Point2<f64>, _: ColorIndex) {
            self.lines += 1;
        }

        fn polygon(&mut self, corners: &[Point2<f64>], color: ColorIndex) {
            self.polygons.push((corners.len(), color));
        }

        fn shaded_polygon(&mut self, _: &[Point2<f64>], _: &[ColorIndex]) {
            self.shaded += 1;
        }

        fn text(&mut self, _: &Point2<f64>, text: &str, _: ColorIndex) {
            self.labels.push(text.to_owned());
        }

        fn marker(&mut self, _: &Point2<f64>, _: ColorIndex) {
            self.markers += 1;
        }
    }

    fn along_x() -> ViewSpec {
        ViewSpec::new(
            Point3::new(10.0, 0.6, 0.7),
            Point3::new(1.0, 0.5, 0.5),
            Vector3::z(),
        )
    }

    #[test]
    fn plot_in_drawing_order() {
        let mut ordered = OrderedMesh::new(two_hex_mesh());
        let view = along_x();
        ordered.ensure_ordered(&view, false).unwrap();
        let transform = view.transform().unwrap();

        let options = PlotOptions {
            element_ids: true,
            corner_markers: true,
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        let count = execute(GridPlot::new(&ordered, &transform, options), &mut recorder);

        assert_eq!(recorder.labels, vec!["0", "1"]);
        assert_eq!(recorder.markers, 16);
        let faces: u32 = ordered.annotations().iter().map(|a| a.faces.count()).sum();
        assert_eq!(recorder.polygons.len() as u32, faces);
        assert_eq!(recorder.lines as u32, faces * 4);
        assert_eq!(
            count,
            recorder.lines + recorder.polygons.len() + recorder.labels.len() + recorder.markers
        );

        let shaded = PlotOptions {
            shaded: true,
            outline: false,
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        execute(GridPlot::new(&ordered, &transform, shaded), &mut recorder);
        assert_eq!(recorder.shaded as u32, faces);
        assert!(recorder.polygons.is_empty());
    }

    #[test]
    fn cut_front_elements_are_skipped() {
        let mut ordered = OrderedMesh::new(two_hex_mesh());
        // removes everything beyond x = 1.5
        let view = along_x().with_cut(CutPlane::new(Point3::new(1.5, 0.0, 0.0), Vector3::x()));
        ordered.ensure_ordered(&view, false).unwrap();
        let transform = view.transform().unwrap();

        let options = PlotOptions {
            element_ids: true,
            ..Default::default()
        };
        let mut recorder = Recorder::default();
        execute(GridPlot::new(&ordered, &transform, options), &mut recorder);
        assert_eq!(recorder.labels, vec!["0", "1"]);
        // element 1 straddles the plane: its section is drawn with the cut color
        assert!(recorder.polygons.contains(&(4, PlotColors::default().cut)));

        let past = along_x().with_cut(CutPlane::new(Point3::new(0.5, 0.0, 0.0), Vector3::x()));
        ordered.ensure_ordered(&past, false).unwrap();
        let transform = past.transform().unwrap();
        let mut recorder = Recorder::default();
        execute(GridPlot::new(&ordered, &transform, options), &mut recorder);
        assert_eq!(recorder.labels, vec!["0"]);
    }

    #[test]
    fn traversals() {
        let mut mesh = two_hex_mesh();
        mesh.refine(1).unwrap();
        let mut ordered = OrderedMesh::new(mesh);
        ordered.ensure_ordered(&along_x(), false).unwrap();

        assert_eq!(Traversal::PlotOrder.walk(&ordered).count(), 10);
        assert_eq!(
            Traversal::Enumeration.walk(&ordered).collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert_eq!(
            Traversal::Level(0).walk(&ordered).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let leaves: Vec<usize> = Traversal::Leaves.walk(&ordered).collect();
        assert_eq!(leaves.len(), 9);
        assert!(!leaves.contains(&1));
        assert_eq!(Traversal::Level(1).walk(&ordered).count(), 8);
    }
}
