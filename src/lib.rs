/// Allocation budget for the temporary graphs of an ordering pass
pub mod arena;
/// Tunable constants of the ordering engine
pub mod config;
/// Ordering a Mesh partitioned across processes
#[cfg(feature = "distributed")]
pub mod distributed;
/// Predicates on projected triangles and quadrilaterals
pub mod geometry;
/// Ordering refined Elements inside their fathers' plot blocks
pub mod hierarchy;
/// Hierarchical 3D Mesh
pub mod mesh;
/// Occlusion candidates and the "hides" graph
pub mod occlusion;
/// Ordering passes and the per-view cache
pub mod ordering;
/// Drawing-instruction streams
pub mod plot;
/// Shell peeling with cycle breaking
pub mod shell;
/// Screen-space box overlap queries
pub mod spatial_index;
/// Observer transformation and cut planes
pub mod view;
/// Face visibility and cut classification
pub mod visibility;

pub use config::OrderingConfig;
pub use mesh::{ElementId, Mesh, MeshAccess};
pub use ordering::{ElementAnnotation, OrderError, OrderedMesh, PassStatus};
pub use plot::{execute, DrawingInstruction, GridPlot, PlotOptions, Rasterizer, Traversal};
pub use view::{CutPlane, Projection, ViewSpec};
