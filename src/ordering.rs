use crate::arena::{OutOfMemory, PassArena};
use crate::config::{ConfigError, OrderingConfig};
use crate::hierarchy::{order_hierarchy, place_block, subtree_sizes};
use crate::mesh::{MeshAccess, MeshError};
use crate::occlusion::{build_candidates, build_graph, PairSearch};
use crate::shell::{peel, ShellError};
use crate::view::{GeometryError, Projection, ViewSignature, ViewSpec};
use crate::visibility::{classify_all, CutRelation, FaceMask};

#[cfg(feature = "distributed")]
use crate::distributed::slot::SlotError;

/// Per-Element results of an ordering pass, consumed by the drawing walk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ElementAnnotation {
    /// Faces pointing towards the observer
    pub faces: FaceMask,
    /// Relation to the active cut plane (if any)
    pub cut: Option<CutRelation>,
    /// Corner permutation used to intersect the Element with the cut plane
    pub order_code: u32,
    /// Rank of the Element in the drawing order
    pub plot_position: u32,
}

/// Failure of a whole ordering pass
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("every coarse Element is hidden by another; no first shell")]
    NoFirstShell,
    #[error("visibility cycle on the coarse grid could not be broken")]
    UntractableCycle,
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error("degenerate view: {0}")]
    GeometryDegenerate(#[from] GeometryError),
    #[cfg(feature = "distributed")]
    #[error("malformed message: {0}")]
    Protocol(#[from] SlotError),
    #[error("inconsistent mesh: {0}")]
    Mesh(#[from] MeshError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<ShellError> for OrderError {
    fn from(err: ShellError) -> Self {
        match err {
            ShellError::NoFirstShell => Self::NoFirstShell,
            ShellError::UntractableCycle { .. } => Self::UntractableCycle,
            ShellError::OutOfMemory(oom) => Self::OutOfMemory(oom),
        }
    }
}

/// Outcome of [`OrderedMesh::ensure_ordered`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassStatus {
    /// A new ordering pass was run
    Ordered,
    /// The view was unchanged; the previous order is still valid
    Cached,
}

/// Statistics from one ordering pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub coarse_elements: usize,
    pub edges: usize,
    pub shells: usize,
    pub cycle_breaks: usize,
    pub fathers: usize,
    pub son_fallbacks: usize,
}

/// Plot positions in enumeration order: coarse Elements as listed, each followed by its subtree
pub fn enumeration_positions<M: MeshAccess>(mesh: &M, sizes: &[u32]) -> Vec<u32> {
    let mut positions = vec![0; mesh.num_elements()];
    let mut next = 0;
    for elem in mesh.elements_on_level(0) {
        positions[elem] = next;
        next += sizes[elem];
    }

    for level in 0..mesh.max_level() {
        for father in mesh.elements_on_level(level) {
            let sons = mesh
                .sons(father)
                .iter()
                .filter_map(|son| mesh.local_index(*son))
                .map(|son| (son, sizes[son]));
            place_block(positions[father], sons, &mut positions);
        }
    }
    positions
}

/// The working state of one sequential ordering pass
///
/// Owns the pass arena; every temporary graph is released when the pass ends, successful or not.
pub struct OrderingPass<'a, M: MeshAccess, P: Projection> {
    mesh: &'a M,
    projection: &'a P,
    config: &'a OrderingConfig,
    arena: PassArena,
}

impl<'a, M: MeshAccess, P: Projection> OrderingPass<'a, M, P> {
    pub fn new(mesh: &'a M, projection: &'a P, config: &'a OrderingConfig) -> Self {
        Self {
            mesh,
            projection,
            config,
            arena: PassArena::new(config.arena_capacity),
        }
    }

    /// Classify every Element, order the coarse grid, then order each refinement level
    ///
    /// Annotations are reset and rewritten; on failure their plot positions are left unspecified.
    pub fn run(mut self, annotations: &mut Vec<ElementAnnotation>) -> Result<PassStats, OrderError> {
        let n = self.mesh.num_elements();
        let all: Vec<usize> = (0..n).collect();
        let visibility = classify_all(self.mesh, &all, self.projection, self.config.depth_epsilon);

        annotations.clear();
        annotations.extend(visibility.iter().map(|v| ElementAnnotation {
            faces: v.faces,
            cut: v.cut,
            order_code: v.order_code,
            plot_position: 0,
        }));
        let faces: Vec<FaceMask> = visibility.iter().map(|v| v.faces).collect();

        // coarse grid
        let coarse = self.mesh.elements_on_level(0);
        let coarse_faces: Vec<FaceMask> = coarse.iter().map(|elem| faces[*elem]).collect();
        let candidates = build_candidates(self.mesh, &coarse, self.projection, &coarse_faces);
        let mark = self.arena.mark();
        let graph = build_graph(
            &candidates,
            PairSearch::Indexed,
            self.config.depth_epsilon,
            &mut self.arena,
        )?;
        let order = peel(&graph, self.config.coarse_cycle_bound, &mut self.arena)?;
        let edges = graph.num_edges();
        drop(graph);
        self.arena.release(mark);

        let sizes = subtree_sizes(self.mesh);
        let mut positions = vec![0; n];
        let mut next = 0;
        for c in order.draw_order() {
            let elem = coarse[c as usize];
            positions[elem] = next;
            next += sizes[elem];
        }

        let hierarchy = order_hierarchy(
            self.mesh,
            self.projection,
            &faces,
            &sizes,
            &mut positions,
            self.config,
            &mut self.arena,
        )?;

        for (annotation, position) in annotations.iter_mut().zip(positions) {
            annotation.plot_position = position;
        }

        let stats = PassStats {
            coarse_elements: coarse.len(),
            edges,
            shells: order.shells,
            cycle_breaks: order.cycle_breaks,
            fathers: hierarchy.fathers,
            son_fallbacks: hierarchy.fallbacks,
        };
        log::debug!("ordering pass: {:?} (arena usage {})", stats, self.arena.used());
        Ok(stats)
    }
}

/// A Mesh together with the annotations and view cache of the ordering engine
///
/// Ordering is lazy: [`OrderedMesh::ensure_ordered`] only runs a new pass when the view signature
/// changes, or when forced (e.g. after the Mesh was modified).
pub struct OrderedMesh<M: MeshAccess> {
    mesh: M,
    config: OrderingConfig,
    annotations: Vec<ElementAnnotation>,
    cached_view: Option<ViewSignature>,
    build_count: usize,
    last_stats: Option<PassStats>,
}

impl<M: MeshAccess> OrderedMesh<M> {
    pub fn new(mesh: M) -> Self {
        Self {
            mesh,
            config: OrderingConfig::default(),
            annotations: Vec::new(),
            cached_view: None,
            build_count: 0,
            last_stats: None,
        }
    }

    /// An unordered Mesh using a custom (validated) configuration
    pub fn with_config(mesh: M, config: OrderingConfig) -> Result<Self, OrderError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(mesh)
        })
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    /// Mutable access to the Mesh; the next call to [`OrderedMesh::ensure_ordered`] will reorder
    pub fn mesh_mut(&mut self) -> &mut M {
        self.invalidate();
        &mut self.mesh
    }

    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    /// Replace the configuration (if valid); the next call to [`OrderedMesh::ensure_ordered`] will reorder
    pub fn set_config(&mut self, config: OrderingConfig) -> Result<(), OrderError> {
        config.validate()?;
        self.config = config;
        self.invalidate();
        Ok(())
    }

    /// Forget the cached view signature
    pub fn invalidate(&mut self) {
        self.cached_view = None;
    }

    /// Number of ordering passes run so far
    pub fn build_count(&self) -> usize {
        self.build_count
    }

    /// Statistics from the last successful pass
    pub fn last_stats(&self) -> Option<&PassStats> {
        self.last_stats.as_ref()
    }

    /// Make sure the Elements are ordered for a view
    ///
    /// Returns [`PassStatus::Cached`] without doing any work if the view's signature matches the last
    /// successful pass (and `force` is false). If the pass fails, every Element falls back to
    /// enumeration order and the error is returned.
    pub fn ensure_ordered(&mut self, view: &ViewSpec, force: bool) -> Result<PassStatus, OrderError> {
        let signature = view.signature();
        if !force && self.cached_view == Some(signature) {
            return Ok(PassStatus::Cached);
        }
        self.cached_view = None;

        let result = match view.transform() {
            Ok(transform) => {
                self.build_count += 1;
                OrderingPass::new(&self.mesh, &transform, &self.config).run(&mut self.annotations)
            }
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(stats) => {
                log::info!(
                    "ordered {} Elements ({} coarse, {} shells)",
                    self.annotations.len(),
                    stats.coarse_elements,
                    stats.shells
                );
                self.cached_view = Some(signature);
                self.last_stats = Some(stats);
                Ok(PassStatus::Ordered)
            }
            Err(err) => {
                log::warn!("element ordering failed ({}); drawing in enumeration order", err);
                self.fall_back();
                Err(err)
            }
        }
    }

    fn fall_back(&mut self) {
        let positions = enumeration_positions(&self.mesh, &subtree_sizes(&self.mesh));
        self.annotations
            .resize(self.mesh.num_elements(), ElementAnnotation::default());
        for (annotation, position) in self.annotations.iter_mut().zip(positions) {
            annotation.plot_position = position;
        }
    }

    /// The annotation of an Element (by local index), once a pass has run
    pub fn annotation(&self, elem: usize) -> Option<&ElementAnnotation> {
        self.annotations.get(elem)
    }

    pub fn annotations(&self) -> &[ElementAnnotation] {
        &self.annotations
    }

    pub fn plot_position(&self, elem: usize) -> Option<u32> {
        self.annotation(elem).map(|a| a.plot_position)
    }

    /// Local Element indices sorted by plot position
    pub fn plot_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.annotations.len()).collect();
        order.sort_by_key(|elem| self.annotations[*elem].plot_position);
        order
    }
}
