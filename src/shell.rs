use crate::arena::{OutOfMemory, PassArena};
use crate::occlusion::OcclusionGraph;

/// Failure to order the nodes of an occlusion graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    #[error("every node is hidden by another node and no cycle could be broken; no first shell")]
    NoFirstShell,
    #[error("visibility cycle among {remaining} nodes could not be broken within the search bound")]
    UntractableCycle { remaining: usize },
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

/// A directed "hides" graph that can be peeled into shells
///
/// `back_edges(n)` lists the nodes hidden by `n`; `in_degree(n)` counts the nodes hiding `n`.
pub trait ShellGraph {
    fn num_nodes(&self) -> usize;

    fn in_degree(&self, node: u32) -> u32;

    fn back_edges(&self, node: u32) -> &[u32];
}

impl ShellGraph for OcclusionGraph {
    fn num_nodes(&self) -> usize {
        self.len()
    }

    fn in_degree(&self, node: u32) -> u32 {
        OcclusionGraph::in_degree(self, node)
    }

    fn back_edges(&self, node: u32) -> &[u32] {
        OcclusionGraph::back_edges(self, node)
    }
}

/// The result of peeling a graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOrder {
    /// Nodes in peeling order: every node appears after all nodes hiding it (front to back)
    pub peeled: Vec<u32>,
    /// Number of shells peeled
    pub shells: usize,
    /// Number of nodes forced out of a visibility cycle
    pub cycle_breaks: usize,
}

impl ShellOrder {
    /// Nodes in painting order: every node appears before all nodes hiding it (back to front)
    pub fn draw_order(&self) -> impl Iterator<Item = u32> + '_ {
        self.peeled.iter().rev().copied()
    }
}

/// Order a graph by repeatedly peeling the shell of nodes that nothing hides any longer
///
/// When a shell comes up empty while nodes remain, the graph contains a visibility cycle: the un-peeled
/// node with the smallest remaining in-degree `k` (searching `k = 1..=cycle_bound`, lowest index
/// first) is forced into the next shell as if everything hiding it had been placed already.
pub fn peel<G: ShellGraph>(
    graph: &G,
    cycle_bound: u32,
    arena: &mut PassArena,
) -> Result<ShellOrder, ShellError> {
    let n = graph.num_nodes();
    let mut remaining = arena.vec(n)?;
    remaining.extend((0..n as u32).map(|node| graph.in_degree(node)));
    let mut is_peeled = arena.filled(n, false)?;
    let mut peeled = arena.vec(n)?;

    let mut layer: Vec<u32> = (0..n as u32)
        .filter(|node| remaining[*node as usize] == 0)
        .collect();
    let mut cycle_breaks = 0;

    if layer.is_empty() && n > 0 {
        let forced = break_cycle(&remaining, &is_peeled, cycle_bound).ok_or(ShellError::NoFirstShell)?;
        cycle_breaks += 1;
        layer.push(forced);
    }

    let mut shells = 0;
    while !layer.is_empty() {
        shells += 1;
        for node in layer.iter() {
            is_peeled[*node as usize] = true;
            peeled.push(*node);
        }

        let mut next = Vec::new();
        for node in layer.iter() {
            for hidden in graph.back_edges(*node) {
                let h = *hidden as usize;
                if is_peeled[h] || remaining[h] == 0 {
                    continue;
                }
                remaining[h] -= 1;
                if remaining[h] == 0 {
                    next.push(*hidden);
                }
            }
        }

        if next.is_empty() && peeled.len() < n {
            let forced = break_cycle(&remaining, &is_peeled, cycle_bound).ok_or(
                ShellError::UntractableCycle {
                    remaining: n - peeled.len(),
                },
            )?;
            log::debug!(
                "breaking visibility cycle at node {} (in-degree {})",
                forced,
                remaining[forced as usize]
            );
            cycle_breaks += 1;
            next.push(forced);
        }

        layer = next;
    }

    Ok(ShellOrder {
        peeled,
        shells,
        cycle_breaks,
    })
}

// the lowest-indexed un-peeled node with the smallest in-degree up to the bound
fn break_cycle(remaining: &[u32], is_peeled: &[bool], bound: u32) -> Option<u32> {
    (1..=bound).find_map(|k| {
        remaining
            .iter()
            .zip(is_peeled.iter())
            .position(|(degree, peeled)| !peeled && *degree == k)
            .map(|node| node as u32)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, edges: &[(u32, u32)]) -> OcclusionGraph {
        let mut arena = PassArena::new(1000);
        let mut graph = OcclusionGraph::with_nodes(n, &mut arena).unwrap();
        for (occluder, occluded) in edges {
            graph.add_edge(*occluder, *occluded, &mut arena).unwrap();
        }
        graph
    }

    fn position(order: &[u32], node: u32) -> usize {
        order.iter().position(|n| *n == node).unwrap()
    }

    #[test]
    fn acyclic_graph() {
        // 0 hides 1, 1 hides 2, 3 hides 2, 4 is alone
        let g = graph(5, &[(0, 1), (1, 2), (3, 2)]);
        let order = peel(&g, 10, &mut PassArena::new(100)).unwrap();

        assert_eq!(order.peeled.len(), 5);
        assert_eq!(order.cycle_breaks, 0);
        assert_eq!(order.shells, 3);

        let draw: Vec<u32> = order.draw_order().collect();
        assert!(position(&draw, 1) < position(&draw, 0));
        assert!(position(&draw, 2) < position(&draw, 1));
        assert!(position(&draw, 2) < position(&draw, 3));
    }

    #[test]
    fn three_cycle() {
        let g = graph(3, &[(0, 1), (1, 2), (2, 0)]);
        let order = peel(&g, 1, &mut PassArena::new(100)).unwrap();
        assert_eq!(order.peeled, vec![0, 1, 2]);
        assert_eq!(order.cycle_breaks, 1);
    }

    #[test]
    fn cycle_behind_a_front_shell() {
        // 3 is in front of the cycle 0 -> 1 -> 2 -> 0
        let g = graph(4, &[(3, 0), (0, 1), (1, 2), (2, 0)]);
        let order = peel(&g, 2, &mut PassArena::new(100)).unwrap();
        assert_eq!(order.peeled[0], 3);
        assert_eq!(order.peeled.len(), 4);
        // once 3 is placed, 0 is still hidden by 2
        assert_eq!(order.cycle_breaks, 1);
    }

    #[test]
    fn untractable_cycles() {
        // every node of the 5-cycle is hidden by two others
        let edges: Vec<(u32, u32)> = (0..5)
            .flat_map(|i| [(i, (i + 1) % 5), (i, (i + 2) % 5)])
            .collect();

        let g = graph(5, &edges);
        assert_eq!(
            peel(&g, 1, &mut PassArena::new(100)).unwrap_err(),
            ShellError::NoFirstShell
        );
        assert!(peel(&g, 2, &mut PassArena::new(100)).is_ok());

        let mut with_front = edges.clone();
        with_front.push((5, 0));
        let g = graph(6, &with_front);
        assert_eq!(
            peel(&g, 1, &mut PassArena::new(100)).unwrap_err(),
            ShellError::UntractableCycle { remaining: 5 }
        );
    }

    #[test]
    fn peel_out_of_memory() {
        let g = graph(10, &[]);
        assert!(matches!(
            peel(&g, 1, &mut PassArena::new(15)),
            Err(ShellError::OutOfMemory(_))
        ));
        assert!(peel(&graph(0, &[]), 1, &mut PassArena::new(0))
            .unwrap()
            .peeled
            .is_empty());
    }
}
