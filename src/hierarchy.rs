use crate::arena::{OutOfMemory, PassArena};
use crate::config::OrderingConfig;
use crate::mesh::MeshAccess;
use crate::occlusion::{build_graph, OcclusionCandidate, PairSearch};
use crate::shell::{peel, ShellError};
use crate::view::Projection;
use crate::visibility::FaceMask;

/// Add the subtree sizes of resident sons to their fathers on one level
///
/// `sizes` must already hold the final sizes of every Element on `level + 1`.
pub fn accumulate_level<M: MeshAccess>(mesh: &M, level: u8, sizes: &mut [u32]) {
    for father in mesh.elements_on_level(level) {
        let from_sons: u32 = mesh
            .sons(father)
            .iter()
            .filter_map(|son| mesh.local_index(*son))
            .map(|son| sizes[son])
            .sum();
        sizes[father] += from_sons;
    }
}

/// Number of Elements in every Element's refinement subtree (including itself)
pub fn subtree_sizes<M: MeshAccess>(mesh: &M) -> Vec<u32> {
    let mut sizes = vec![1; mesh.num_elements()];
    for level in (0..mesh.max_level()).rev() {
        accumulate_level(mesh, level, &mut sizes);
    }
    sizes
}

/// Order a small set of candidates (the sons of one father) by pairwise occlusion tests
///
/// Returns candidate indices in drawing order, or `None` if the son graph could not be peeled.
/// Graph storage is returned to the arena before returning.
pub fn order_candidates(
    candidates: &[OcclusionCandidate],
    config: &OrderingConfig,
    arena: &mut PassArena,
) -> Result<Option<Vec<u32>>, OutOfMemory> {
    let mark = arena.mark();
    let result = build_graph(candidates, PairSearch::Pairwise, config.depth_epsilon, arena)
        .map_err(ShellError::from)
        .and_then(|graph| peel(&graph, config.son_cycle_bound, arena));
    arena.release(mark);

    match result {
        Ok(order) => Ok(Some(order.draw_order().collect())),
        Err(ShellError::OutOfMemory(oom)) => Err(oom),
        Err(err) => {
            log::warn!(
                "unable to order {} sons ({}); using enumeration order",
                candidates.len(),
                err
            );
            Ok(None)
        }
    }
}

/// The resident sons of a father in drawing order
///
/// Falls back to the father's enumeration order of its sons if their occlusion graph can't be peeled.
/// The flag is `false` in that case.
pub fn order_sons<M: MeshAccess, P: Projection>(
    mesh: &M,
    father: usize,
    projection: &P,
    faces: &[FaceMask],
    config: &OrderingConfig,
    arena: &mut PassArena,
) -> Result<(Vec<usize>, bool), OutOfMemory> {
    let sons: Vec<usize> = mesh
        .sons(father)
        .iter()
        .filter_map(|son| mesh.local_index(*son))
        .collect();

    if sons.len() < 2 {
        return Ok((sons, true));
    }

    let candidates: Vec<OcclusionCandidate> = sons
        .iter()
        .map(|son| OcclusionCandidate::from_element(mesh, *son, projection, faces[*son]))
        .collect();

    Ok(match order_candidates(&candidates, config, arena)? {
        Some(order) => (order.iter().map(|c| sons[*c as usize]).collect(), true),
        None => (sons, false),
    })
}

/// Give each son a block of plot positions directly after its father's position
///
/// `sons` yields `(son, subtree size)` in drawing order.
pub fn place_block(
    father_position: u32,
    sons: impl IntoIterator<Item = (usize, u32)>,
    positions: &mut [u32],
) {
    let mut next = father_position + 1;
    for (son, size) in sons {
        positions[son] = next;
        next += size;
    }
}

/// Counts from a hierarchical ordering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HierarchyStats {
    /// Fathers whose sons were ordered
    pub fathers: usize,
    /// Fathers whose sons fell back to enumeration order
    pub fallbacks: usize,
}

/// Order the sons of every refined Element, level by level from the coarse grid up
///
/// Coarse grid positions must already be set in `positions`. Each father's sons are ordered with the
/// same occlusion relation as the coarse grid and given the block of positions following the father.
pub fn order_hierarchy<M: MeshAccess, P: Projection>(
    mesh: &M,
    projection: &P,
    faces: &[FaceMask],
    sizes: &[u32],
    positions: &mut [u32],
    config: &OrderingConfig,
    arena: &mut PassArena,
) -> Result<HierarchyStats, OutOfMemory> {
    let mut stats = HierarchyStats::default();

    for level in 0..mesh.max_level() {
        for father in mesh.elements_on_level(level) {
            if mesh.sons(father).is_empty() {
                continue;
            }
            let (sons, ordered) = order_sons(mesh, father, projection, faces, config, arena)?;
            stats.fathers += 1;
            if !ordered {
                stats.fallbacks += 1;
            }
            place_block(
                positions[father],
                sons.iter().map(|son| (*son, sizes[*son])),
                positions,
            );
        }
    }

    Ok(stats)
}
