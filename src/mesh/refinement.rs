use super::{element::ElementShape, ElementId, Mesh, MeshAccess, MeshError, NodeId, MAX_LEVEL};
use nalgebra::Point3;
use smallvec::SmallVec;

// reference coordinates of the 8 hexahedron corners
const HEX_CORNER_OFFSETS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

impl Mesh {
    /// Refine a hexahedral Element isotropically into 8 sons
    ///
    /// New Nodes are created at edge midpoints, face centers and the body center. Nodes created by an
    /// earlier refinement of a neighboring Element are reused, so sons of adjacent fathers share faces.
    ///
    /// Son `i + 2j + 4k` occupies octant `(i, j, k)` of the father's reference cell.
    /// Returns the ids of the new sons.
    pub fn refine(&mut self, id: ElementId) -> Result<SmallVec<[ElementId; 8]>, MeshError> {
        let sons = self.refine_without_connecting(id)?;
        self.connect_faces()?;
        Ok(sons)
    }

    /// Refine every son-less Element on a level
    pub fn refine_all(&mut self, level: u8) -> Result<Vec<ElementId>, MeshError> {
        let targets: Vec<ElementId> = self
            .elements_on_level(level)
            .into_iter()
            .filter(|idx| !self.elements[*idx].has_sons())
            .map(|idx| self.elements[idx].id)
            .collect();

        let mut new_sons = Vec::with_capacity(targets.len() * 8);
        for id in targets {
            new_sons.extend(self.refine_without_connecting(id)?);
        }
        self.connect_faces()?;
        Ok(new_sons)
    }

    fn refine_without_connecting(
        &mut self,
        id: ElementId,
    ) -> Result<SmallVec<[ElementId; 8]>, MeshError> {
        let father_idx = self
            .local_index(id)
            .ok_or(MeshError::ElementDoesntExist(id))?;
        let father = &self.elements[father_idx];

        if father.has_sons() {
            return Err(MeshError::ElementHasSons(id));
        }
        if father.shape != ElementShape::Hexahedron {
            return Err(MeshError::UnsupportedRefinement(id, father.shape));
        }
        if father.level >= MAX_LEVEL {
            return Err(MeshError::MaxLevelExceeded(id));
        }

        let father_nodes = father.nodes.clone();

        // 3x3x3 lattice of nodes over the father
        let mut lattice = [[[0 as NodeId; 3]; 3]; 3];
        for (a, plane) in lattice.iter_mut().enumerate() {
            for (b, row) in plane.iter_mut().enumerate() {
                for (c, node) in row.iter_mut().enumerate() {
                    *node = self.lattice_node(&father_nodes, [a, b, c]);
                }
            }
        }

        let mut sons = SmallVec::new();
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    let son_nodes = HEX_CORNER_OFFSETS
                        .iter()
                        .map(|[ci, cj, ck]| lattice[i + ci][j + cj][k + ck])
                        .collect();
                    sons.push(self.add_element(ElementShape::Hexahedron, son_nodes, Some(id))?);
                }
            }
        }

        Ok(sons)
    }

    // Node at lattice position [a, b, c] (each in 0..=2) of a hexahedron, creating it if needed
    fn lattice_node(&mut self, father_nodes: &[NodeId], [a, b, c]: [usize; 3]) -> NodeId {
        let spanned: SmallVec<[NodeId; 8]> = HEX_CORNER_OFFSETS
            .iter()
            .enumerate()
            .filter(|(_, offset)| {
                [a, b, c]
                    .iter()
                    .zip(offset.iter())
                    .all(|(pos, off)| *pos == 1 || *pos == 2 * off)
            })
            .map(|(corner, _)| father_nodes[corner])
            .collect();

        if spanned.len() == 1 {
            return spanned[0];
        }

        let mut key = spanned.clone();
        key.sort_unstable();

        if let Some(existing) = self.refinement_nodes.get(&key) {
            return *existing;
        }

        let sum = spanned
            .iter()
            .filter_map(|node_id| self.node_coords(*node_id))
            .fold(Point3::origin().coords, |acc, p| acc + p.coords);
        let new_id = self.add_node(Point3::from(sum / spanned.len() as f64));
        self.refinement_nodes.insert(key, new_id);
        new_id
    }
}
