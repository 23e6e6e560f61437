use fem_view::mesh::Mesh;
use fem_view::occlusion::{build_candidates, occlusion_edges, PairSearch};
use fem_view::plot::{execute, ColorIndex, GridPlot, PlotOptions, Rasterizer};
use fem_view::view::ViewTransform;
use fem_view::visibility::{classify_all, CutRelation, FaceMask};
use fem_view::{CutPlane, MeshAccess, OrderedMesh, OrderingConfig, PassStatus, ViewSpec};
use nalgebra::{Point2, Point3, Vector3};

fn oblique() -> ViewSpec {
    ViewSpec::new(
        Point3::new(6.0, -4.5, 7.0),
        Point3::new(1.0, 1.0, 0.5),
        Vector3::z(),
    )
}

// 2x2 grid with one refined corner cell, one refined son and one refined cell on the far side
fn refined_grid() -> Mesh {
    let mut mesh = Mesh::from_file("./test_input/quad_grid.json").unwrap();
    mesh.refine(0).unwrap();
    mesh.refine(3).unwrap();
    mesh.refine(4).unwrap();
    mesh
}

// every edge of the occlusion relation among `elems` must point from a later to an earlier plot position
fn assert_painter_order(mesh: &Mesh, ordered: &OrderedMesh<Mesh>, transform: &ViewTransform, elems: &[usize]) {
    let faces: Vec<FaceMask> = classify_all(mesh, elems, transform, 1e-10)
        .iter()
        .map(|v| v.faces)
        .collect();
    let candidates = build_candidates(mesh, elems, transform, &faces);
    for (occluder, occluded) in occlusion_edges(&candidates, PairSearch::Pairwise, 1e-10) {
        let occluder = elems[occluder as usize];
        let occluded = elems[occluded as usize];
        assert!(
            ordered.plot_position(occluded) < ordered.plot_position(occluder),
            "{} hides {} but is drawn first",
            occluder,
            occluded
        );
    }
}

#[test]
fn diagonal_tetrahedra() {
    let mesh = Mesh::from_file("./test_input/diagonal_tets.json").unwrap();
    assert_eq!(mesh.elements[0].neighbor(2), Some(1));
    let mut ordered = OrderedMesh::new(mesh);

    let above = ViewSpec::new(
        Point3::new(0.4, 0.3, 10.0),
        Point3::new(0.5, 0.5, 0.5),
        Vector3::y(),
    );
    assert_eq!(ordered.ensure_ordered(&above, false), Ok(PassStatus::Ordered));
    assert_eq!(ordered.plot_order(), vec![0, 1]);

    let below = ViewSpec::new(
        Point3::new(0.4, 0.3, -10.0),
        Point3::new(0.5, 0.5, 0.5),
        Vector3::y(),
    );
    assert_eq!(ordered.ensure_ordered(&below, false), Ok(PassStatus::Ordered));
    assert_eq!(ordered.plot_order(), vec![1, 0]);
}

#[test]
fn painter_order_and_completeness() {
    let mesh = refined_grid();
    let view = oblique();
    let transform = view.transform().unwrap();
    let mut ordered = OrderedMesh::new(mesh.clone());
    ordered.ensure_ordered(&view, false).unwrap();

    let stats = ordered.last_stats().unwrap();
    assert_eq!(stats.coarse_elements, 4);
    assert_eq!(stats.cycle_breaks, 0);
    assert_eq!(stats.fathers, 3);
    assert_eq!(stats.son_fallbacks, 0);

    // each Element exactly once
    let mut positions: Vec<u32> = (0..mesh.num_elements())
        .map(|e| ordered.plot_position(e).unwrap())
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (0..28).collect::<Vec<u32>>());

    assert_painter_order(&mesh, &ordered, &transform, &mesh.elements_on_level(0));
    for father in [0, 3, 4] {
        let sons: Vec<usize> = mesh.sons(father).iter().map(|s| *s as usize).collect();
        assert_painter_order(&mesh, &ordered, &transform, &sons);
    }
}

#[test]
fn hierarchical_containment() {
    let mesh = refined_grid();
    let mut ordered = OrderedMesh::new(mesh.clone());
    ordered.ensure_ordered(&oblique(), false).unwrap();

    let sizes = fem_view::hierarchy::subtree_sizes(&mesh);
    assert_eq!(&sizes[..5], &[17, 1, 1, 9, 9]);

    for father in 0..mesh.num_elements() {
        let first = ordered.plot_position(father).unwrap();
        for son in mesh.sons(father) {
            let position = ordered.plot_position(*son as usize).unwrap();
            assert!(position > first && position < first + sizes[father]);
        }
    }
}

#[test]
fn unchanged_views_are_cached() {
    let mut ordered = OrderedMesh::new(refined_grid());
    let view = oblique();

    assert_eq!(ordered.ensure_ordered(&view, false), Ok(PassStatus::Ordered));
    let first = ordered.plot_order();
    assert_eq!(ordered.ensure_ordered(&view, false), Ok(PassStatus::Cached));
    assert_eq!(ordered.build_count(), 1);
    assert_eq!(ordered.plot_order(), first);

    assert_eq!(ordered.ensure_ordered(&view, true), Ok(PassStatus::Ordered));
    assert_eq!(ordered.build_count(), 2);
    assert_eq!(ordered.plot_order(), first);

    // moving the cut plane changes the signature
    let cut = view.with_cut(CutPlane::new(Point3::new(1.0, 1.0, 0.5), Vector3::x()));
    assert_eq!(ordered.ensure_ordered(&cut, false), Ok(PassStatus::Ordered));
    assert_eq!(ordered.build_count(), 3);
}

#[test]
fn configuration_file() {
    let config = OrderingConfig::from_file("./test_input/ordering_config.json").unwrap();
    assert_eq!(config.depth_epsilon, 1e-9);
    assert_eq!(config.coarse_cycle_bound, 12);
    assert_eq!(config.branching_factor, 2);
    assert_eq!(config.slot_size, 2048);
    assert_eq!(config.son_cycle_bound, OrderingConfig::default().son_cycle_bound);

    let mut ordered = OrderedMesh::with_config(refined_grid(), config).unwrap();
    assert!(ordered.ensure_ordered(&oblique(), false).is_ok());
    assert!(OrderingConfig::from_file("./test_input/missing.json").is_err());
}

#[derive(Default)]
struct Labels(Vec<String>);

impl Rasterizer for Labels {
    fn line(&mut self, _: &Point2<f64>, _: &Point2<f64>, _: ColorIndex) {}

    fn polygon(&mut self, _: &[Point2<f64>], _: ColorIndex) {}

    fn shaded_polygon(&mut self, _: &[Point2<f64>], _: &[ColorIndex]) {}

    fn text(&mut self, _: &Point2<f64>, text: &str, _: ColorIndex) {
        self.0.push(text.to_owned());
    }

    fn marker(&mut self, _: &Point2<f64>, _: ColorIndex) {}
}

#[test]
fn cut_away_elements_are_not_drawn() {
    let mut ordered = OrderedMesh::new(Mesh::from_file("./test_input/quad_grid.json").unwrap());
    // removes the column x > 1.5: elements 1 and 3 straddle the plane, nothing is in front of it
    let half = oblique().with_cut(CutPlane::new(Point3::new(1.5, 0.0, 0.0), Vector3::x()));
    ordered.ensure_ordered(&half, false).unwrap();
    assert!(ordered
        .annotations()
        .iter()
        .all(|a| a.cut != Some(CutRelation::Front)));

    // removes x > 0.9: elements 1 and 3 are entirely on the removed side
    let view = oblique().with_cut(CutPlane::new(Point3::new(0.9, 0.0, 0.0), Vector3::x()));
    ordered.ensure_ordered(&view, false).unwrap();
    assert_eq!(ordered.annotation(1).unwrap().cut, Some(CutRelation::Front));
    assert_eq!(ordered.annotation(0).unwrap().cut, Some(CutRelation::Straddling));

    let transform = view.transform().unwrap();
    let options = PlotOptions {
        element_ids: true,
        ..Default::default()
    };
    let mut labels = Labels::default();
    execute(GridPlot::new(&ordered, &transform, options), &mut labels);
    labels.0.sort();
    assert_eq!(labels.0, vec!["0", "2"]);
}
