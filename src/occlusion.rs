use crate::arena::{OutOfMemory, PassArena};
use crate::geometry::{compare_quadrilaterals, Occlusion, ProjectedPoint, ScreenBox};
use crate::mesh::{ElementId, MeshAccess};
use crate::spatial_index::SpatialIndex;
use crate::view::Projection;
use crate::visibility::FaceMask;
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;

/// A face of a candidate, projected onto the screen
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedFace {
    pub corners: SmallVec<[ProjectedPoint; 4]>,
    /// Does the face point towards the observer
    pub visible: bool,
    /// Element on the other side of the face
    pub neighbor: Option<ElementId>,
}

/// The data needed to test an Element for occlusion against other Elements
#[derive(Clone, Debug, PartialEq)]
pub struct OcclusionCandidate {
    pub id: ElementId,
    pub bbox: ScreenBox,
    pub depth_min: f64,
    pub depth_max: f64,
    pub faces: SmallVec<[ProjectedFace; 6]>,
}

impl OcclusionCandidate {
    /// Project an Element's faces for the current view
    pub fn from_element<M: MeshAccess, P: Projection>(
        mesh: &M,
        elem: usize,
        projection: &P,
        visible_faces: FaceMask,
    ) -> Self {
        let shape = mesh.shape(elem);
        let projected: SmallVec<[ProjectedPoint; 8]> = mesh
            .corners(elem)
            .iter()
            .map(|p| {
                let screen = projection.project_to_screen(p);
                ProjectedPoint::new(screen.x, screen.y, projection.eye_space_depth(p))
            })
            .collect();

        let faces = shape
            .faces()
            .iter()
            .enumerate()
            .map(|(face_idx, face)| ProjectedFace {
                corners: face.iter().map(|c| projected[*c]).collect(),
                visible: visible_faces.contains(face_idx),
                neighbor: mesh.neighbor_across_face(elem, face_idx),
            })
            .collect();

        let bbox = ScreenBox::from_points(projected.iter().map(|p| &p.screen));
        let (depth_min, depth_max) = projected
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), p| {
                (min.min(p.depth), max.max(p.depth))
            });

        Self {
            id: mesh.global_id(elem),
            bbox,
            depth_min,
            depth_max,
            faces,
        }
    }

    /// Is this candidate adjacent to another Element across one of its faces
    pub fn is_neighbor_of(&self, id: ElementId) -> bool {
        self.faces.iter().any(|face| face.neighbor == Some(id))
    }
}

/// Build the candidates for a set of Elements in parallel
pub fn build_candidates<M: MeshAccess, P: Projection>(
    mesh: &M,
    elems: &[usize],
    projection: &P,
    visible_faces: &[FaceMask],
) -> Vec<OcclusionCandidate> {
    elems
        .par_iter()
        .zip(visible_faces.par_iter())
        .map(|(elem, mask)| OcclusionCandidate::from_element(mesh, *elem, projection, *mask))
        .collect()
}

/// Directed "hides" relation between the candidates of one pass
///
/// An edge `occluder -> occluded` increments the occluded node's in-degree and is stored in the
/// occluder's back-edge list, so that placing the occluder releases the occluded node.
#[derive(Clone, Debug, Default)]
pub struct OcclusionGraph {
    in_degree: Vec<u32>,
    back_edges: Vec<SmallVec<[u32; 4]>>,
    num_edges: usize,
}

impl OcclusionGraph {
    /// A graph with `n` nodes and no edges
    pub fn with_nodes(n: usize, arena: &mut PassArena) -> Result<Self, OutOfMemory> {
        Ok(Self {
            in_degree: arena.filled(n, 0)?,
            back_edges: arena.filled(n, SmallVec::new())?,
            num_edges: 0,
        })
    }

    /// Record that `occluder` hides `occluded`
    pub fn add_edge(
        &mut self,
        occluder: u32,
        occluded: u32,
        arena: &mut PassArena,
    ) -> Result<(), OutOfMemory> {
        arena.push(&mut self.back_edges[occluder as usize], occluded)?;
        self.in_degree[occluded as usize] += 1;
        self.num_edges += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.in_degree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_degree.is_empty()
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// Number of nodes known to hide a node
    pub fn in_degree(&self, node: u32) -> u32 {
        self.in_degree[node as usize]
    }

    /// The nodes hidden by a node
    pub fn back_edges(&self, node: u32) -> &[u32] {
        &self.back_edges[node as usize]
    }

    /// Does `occluder` hide `occluded`
    pub fn hides(&self, occluder: u32, occluded: u32) -> bool {
        self.back_edges(occluder).contains(&occluded)
    }
}

// boundary faces are faces without a neighbor in the candidate set
#[derive(Clone, Copy, Debug, Default)]
struct BoundarySummary {
    any: bool,
    viewable: bool,
    hidden: bool,
}

struct CandidateSet<'a> {
    candidates: &'a [OcclusionCandidate],
    index_of: HashMap<ElementId, u32>,
    summaries: Vec<BoundarySummary>,
}

impl<'a> CandidateSet<'a> {
    fn new(candidates: &'a [OcclusionCandidate]) -> Self {
        let index_of: HashMap<ElementId, u32> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i as u32))
            .collect();

        let summaries = candidates
            .iter()
            .map(|c| {
                c.faces
                    .iter()
                    .filter(|face| face.neighbor.map_or(true, |n| !index_of.contains_key(&n)))
                    .fold(BoundarySummary::default(), |mut summary, face| {
                        summary.any = true;
                        if face.visible {
                            summary.viewable = true;
                        } else {
                            summary.hidden = true;
                        }
                        summary
                    })
            })
            .collect();

        Self {
            candidates,
            index_of,
            summaries,
        }
    }

    fn is_boundary(&self, face: &ProjectedFace) -> bool {
        face.neighbor
            .map_or(true, |n| !self.index_of.contains_key(&n))
    }

    fn boundary_faces(&self, i: u32, visible: bool) -> impl Iterator<Item = &ProjectedFace> + '_ {
        self.candidates[i as usize]
            .faces
            .iter()
            .filter(move |face| face.visible == visible && self.is_boundary(face))
    }

    // compare the hidden boundary faces of `a` with the viewable boundary faces of `b`
    fn compare_faces(&self, a: u32, b: u32, eps: f64) -> Occlusion {
        for hidden in self.boundary_faces(a, false) {
            for viewable in self.boundary_faces(b, true) {
                let result = compare_quadrilaterals(&hidden.corners, &viewable.corners, eps);
                if result.is_determined() {
                    return result;
                }
            }
        }
        Occlusion::Undetermined
    }

    /// The occlusion relation between two non-adjacent candidates as `(occluder, occluded)`
    fn relation(&self, i: u32, j: u32, eps: f64) -> Option<(u32, u32)> {
        let (ci, cj) = (&self.candidates[i as usize], &self.candidates[j as usize]);
        if ci.is_neighbor_of(cj.id) || cj.is_neighbor_of(ci.id) {
            return None;
        }

        let (si, sj) = (&self.summaries[i as usize], &self.summaries[j as usize]);
        let mut result = Occlusion::Undetermined;
        if si.hidden && sj.viewable {
            result = self.compare_faces(i, j, eps);
        }
        if !result.is_determined() && sj.hidden && si.viewable {
            result = self.compare_faces(j, i, eps).flipped();
        }

        match result {
            Occlusion::FirstHides => Some((i, j)),
            Occlusion::SecondHides => Some((j, i)),
            Occlusion::Undetermined => None,
        }
    }
}

/// How overlapping candidate pairs are found
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairSearch {
    /// Query a [`SpatialIndex`] over the boundary candidates
    Indexed,
    /// Test every pair (small candidate sets)
    Pairwise,
}

/// Find the "hides" relation of a candidate set as `(occluder, occluded)` pairs of candidate indices
///
/// 1. Candidates sharing a face are related directly: the candidate that sees the shared face is
///    behind it, so the neighbor hides it.
/// 2. Candidates with boundary faces (faces without a neighbor in the set) are paired through their
///    overlapping screen boxes, and the hidden boundary faces of each are compared with the viewable
///    boundary faces of the other.
pub fn occlusion_edges(
    candidates: &[OcclusionCandidate],
    search: PairSearch,
    eps: f64,
) -> Vec<(u32, u32)> {
    let set = CandidateSet::new(candidates);

    // adjacency
    let index_of = &set.index_of;
    let mut edges: Vec<(u32, u32)> = candidates
        .iter()
        .enumerate()
        .flat_map(|(i, candidate)| {
            candidate
                .faces
                .iter()
                .filter(|face| face.visible)
                .filter_map(move |face| face.neighbor.and_then(|n| index_of.get(&n)))
                .map(move |neighbor| (*neighbor, i as u32))
        })
        .collect();
    let adjacency_edges = edges.len();

    let members: Vec<u32> = (0..candidates.len() as u32)
        .filter(|i| set.summaries[*i as usize].any)
        .collect();

    match search {
        PairSearch::Indexed => {
            let boxes: Vec<ScreenBox> = candidates.iter().map(|c| c.bbox).collect();
            let index = SpatialIndex::build_subset(&boxes, members.clone());
            let geometric: Vec<(u32, u32)> = members
                .par_iter()
                .flat_map_iter(|i| {
                    index
                        .query(*i)
                        .into_iter()
                        .filter_map(|j| set.relation(*i, j, eps))
                        .collect::<Vec<_>>()
                })
                .collect();
            edges.extend(geometric);
        }
        PairSearch::Pairwise => {
            for (k, i) in members.iter().enumerate() {
                for j in members[..k].iter() {
                    if candidates[*i as usize]
                        .bbox
                        .overlaps(&candidates[*j as usize].bbox)
                    {
                        edges.extend(set.relation(*i, *j, eps));
                    }
                }
            }
        }
    }

    log::debug!(
        "occlusion graph: {} candidates ({} on the boundary), {} adjacency and {} geometric edges",
        candidates.len(),
        members.len(),
        adjacency_edges,
        edges.len() - adjacency_edges
    );

    edges
}

/// Build the occlusion graph of a candidate set (see [`occlusion_edges`])
///
/// All graph storage is charged against the pass arena.
pub fn build_graph(
    candidates: &[OcclusionCandidate],
    search: PairSearch,
    eps: f64,
    arena: &mut PassArena,
) -> Result<OcclusionGraph, OutOfMemory> {
    let mut graph = OcclusionGraph::with_nodes(candidates.len(), arena)?;
    for (occluder, occluded) in occlusion_edges(candidates, search, eps) {
        graph.add_edge(occluder, occluded, arena)?;
    }
    Ok(graph)
}
