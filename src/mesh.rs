/// 3D cell shapes and the `Element` structure
pub mod element;
/// A Point in Real Space
pub mod node;
/// Isotropic h-refinement of hexahedral Elements
pub mod refinement;

use element::{Element, ElementShape};
use node::Node;

use json::{object, JsonValue};
use nalgebra::Point3;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::fs::{read_to_string, File};
use std::io::BufWriter;

/// Globally unique Element identifier (dense indices in a sequential Mesh)
pub type ElementId = u64;
/// Globally unique Node identifier
pub type NodeId = u64;

/// Maximum number of refinement levels supported by a Mesh
pub const MAX_LEVEL: u8 = 15;

/// The Error Type for invalid Mesh construction or access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("unable to read mesh file: {0}")]
    Io(String),
    #[error("unable to parse mesh file as JSON: {0}")]
    Json(String),
    #[error("mesh file is missing a valid {0:?} entry")]
    MissingEntry(&'static str),
    #[error("Element {0} has an invalid corner count ({1}); cannot construct Mesh")]
    BadCornerCount(usize, usize),
    #[error("Element {0} references Node {1}, which doesn't exist")]
    NodeDoesntExist(ElementId, NodeId),
    #[error("Element {0} doesn't exist")]
    ElementDoesntExist(ElementId),
    #[error("a face of Element {0} is shared by more than two Elements")]
    NonManifoldFace(ElementId),
    #[error("Element {0} already has sons; cannot refine it again")]
    ElementHasSons(ElementId),
    #[error("Element {0} is a {1}; only hexahedra can be refined")]
    UnsupportedRefinement(ElementId, ElementShape),
    #[error("Element {0} is already on the finest supported level")]
    MaxLevelExceeded(ElementId),
    #[error("owner list has {0} entries but the Mesh has {1} Elements")]
    OwnerCountMismatch(usize, usize),
}

/// Read-only access to a hierarchical Mesh, as needed by the ordering engine
///
/// Elements are addressed by their process-local index; connections are global [`ElementId`]s
/// which may refer to Elements resident on another process (see [`MeshAccess::local_index`]).
pub trait MeshAccess: Sync {
    fn num_elements(&self) -> usize;

    /// Local indices of all resident Elements on a refinement level, in enumeration order
    fn elements_on_level(&self, level: u8) -> Vec<usize>;

    /// Finest refinement level among the resident Elements
    fn max_level(&self) -> u8;

    fn shape(&self, elem: usize) -> ElementShape;

    fn corners(&self, elem: usize) -> SmallVec<[Point3<f64>; 8]>;

    /// Global Node ids of an Element's corners (same order as [`MeshAccess::corners`])
    fn corner_ids(&self, elem: usize) -> &[NodeId];

    fn neighbor_across_face(&self, elem: usize, face: usize) -> Option<ElementId>;

    fn father(&self, elem: usize) -> Option<ElementId>;

    fn sons(&self, elem: usize) -> &[ElementId];

    fn level(&self, elem: usize) -> u8;

    fn global_id(&self, elem: usize) -> ElementId;

    /// Local index of a resident Element (`None` if it lives on another process or doesn't exist)
    fn local_index(&self, id: ElementId) -> Option<usize>;

    /// Rank of the process owning an Element
    fn owner_of(&self, id: ElementId) -> Option<usize>;
}

/// Geometric and hierarchical structure of a (possibly partitioned) 3D Mesh
#[derive(Debug, Clone)]
pub struct Mesh {
    pub elements: Vec<Element>,
    pub nodes: Vec<Node>,
    /// Rank of the process this Mesh is resident on
    pub rank: usize,
    element_index: HashMap<ElementId, usize>,
    node_index: HashMap<NodeId, usize>,
    remote_owners: BTreeMap<ElementId, usize>,
    // {sorted ids of the father's corners spanning a new Node => new Node id}
    refinement_nodes: BTreeMap<SmallVec<[NodeId; 8]>, NodeId>,
}

impl Mesh {
    /// Construct a completely empty Mesh
    pub fn blank() -> Self {
        Self {
            elements: Vec::new(),
            nodes: Vec::new(),
            rank: 0,
            element_index: HashMap::new(),
            node_index: HashMap::new(),
            remote_owners: BTreeMap::new(),
            refinement_nodes: BTreeMap::new(),
        }
    }

    /// Construct a Mesh from a JSON file with the following format
    ///
    /// `node_ids` list an Element's corners in the order described by [`ElementShape`].
    /// `shape` may be omitted, in which case it is inferred from the number of corners.
    ///
    /// The following file describes a single tetrahedron sitting on top of a pyramid:
    /// ```JSON
    /// {
    ///     "Nodes": [
    ///         [0.0, 0.0, 0.0],
    ///         [1.0, 0.0, 0.0],
    ///         [1.0, 1.0, 0.0],
    ///         [0.0, 1.0, 0.0],
    ///         [0.5, 0.5, 1.0],
    ///         [0.5, 0.5, 2.0]
    ///     ],
    ///     "Elements": [
    ///         { "shape": "pyramid", "node_ids": [0, 1, 2, 3, 4] },
    ///         { "node_ids": [1, 2, 4, 5] }
    ///     ]
    /// }
    /// ```
    ///
    /// Neighbor relations are derived from shared faces ([`Mesh::connect_faces`]).
    pub fn from_file(path: impl AsRef<str>) -> Result<Self, MeshError> {
        let contents =
            read_to_string(path.as_ref()).map_err(|err| MeshError::Io(err.to_string()))?;
        Self::from_json(&contents)
    }

    /// Construct a Mesh from the contents of a JSON mesh file (see [`Mesh::from_file`])
    pub fn from_json(contents: &str) -> Result<Self, MeshError> {
        let mesh_json = json::parse(contents).map_err(|err| MeshError::Json(err.to_string()))?;

        let mut mesh = Self::blank();

        if !mesh_json["Nodes"].is_array() {
            return Err(MeshError::MissingEntry("Nodes"));
        }
        for node_json in mesh_json["Nodes"].members() {
            let coords: Vec<f64> = node_json.members().filter_map(|c| c.as_f64()).collect();
            if coords.len() != 3 {
                return Err(MeshError::MissingEntry("Nodes"));
            }
            mesh.add_node(Point3::new(coords[0], coords[1], coords[2]));
        }

        if !mesh_json["Elements"].is_array() {
            return Err(MeshError::MissingEntry("Elements"));
        }
        for (element_idx, element_json) in mesh_json["Elements"].members().enumerate() {
            let node_ids: SmallVec<[NodeId; 8]> = element_json["node_ids"]
                .members()
                .filter_map(|id| id.as_u64())
                .collect();

            let shape = match element_json["shape"].as_str() {
                Some(name) => {
                    ElementShape::from_name(name).ok_or(MeshError::MissingEntry("shape"))?
                }
                None => ElementShape::from_num_corners(node_ids.len())
                    .ok_or(MeshError::BadCornerCount(element_idx, node_ids.len()))?,
            };

            mesh.add_element(shape, node_ids, None)?;
        }

        mesh.connect_faces()?;
        Ok(mesh)
    }

    /// Print the mesh to a JSON file specified by path.
    pub fn export_to_json(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        let f = File::create(path.as_ref())?;
        let mut w = BufWriter::new(&f);

        let mesh_object = object! {
            "Nodes": JsonValue::from(self.nodes.iter().map(|node| node.to_json()).collect::<Vec<_>>()),
            "Elements": JsonValue::from(self.elements.iter().map(|element| element.to_json()).collect::<Vec<_>>()),
        };

        mesh_object.write_pretty(&mut w, 4)?;

        Ok(())
    }

    // ----------------------------------------------------------------------------------------------------
    // Construction
    // ----------------------------------------------------------------------------------------------------

    /// Add a Node, returning its id
    pub fn add_node(&mut self, coords: Point3<f64>) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.node_index.insert(id, self.nodes.len());
        self.nodes.push(Node::new(id, coords));
        id
    }

    /// Add an Element made from existing Nodes, returning its id
    ///
    /// Neighbor relations are not updated until [`Mesh::connect_faces`] is called
    pub fn add_element(
        &mut self,
        shape: ElementShape,
        node_ids: SmallVec<[NodeId; 8]>,
        father: Option<ElementId>,
    ) -> Result<ElementId, MeshError> {
        let id = self.elements.len() as ElementId;

        if node_ids.len() != shape.num_corners() {
            return Err(MeshError::BadCornerCount(self.elements.len(), node_ids.len()));
        }
        if let Some(missing) = node_ids.iter().find(|n| !self.node_index.contains_key(n)) {
            return Err(MeshError::NodeDoesntExist(id, *missing));
        }

        let level = match father {
            Some(father_id) => {
                let father_idx = self
                    .local_index(father_id)
                    .ok_or(MeshError::ElementDoesntExist(father_id))?;
                self.elements[father_idx].sons.push(id);
                self.elements[father_idx].level + 1
            }
            None => 0,
        };

        self.element_index.insert(id, self.elements.len());
        self.elements
            .push(Element::new(id, shape, node_ids, father, level));
        Ok(id)
    }

    /// Derive the neighbor-across-face relations between all Elements on the same level
    ///
    /// Faces are matched through their sorted Node ids. Faces with no match (domain boundary, or the
    /// interface to a coarser Element) have no neighbor.
    pub fn connect_faces(&mut self) -> Result<(), MeshError> {
        // {sorted face node ids => [(element index, face index)]}
        let mut face_map: BTreeMap<(u8, SmallVec<[NodeId; 4]>), SmallVec<[(usize, usize); 2]>> =
            BTreeMap::new();

        for (elem_idx, element) in self.elements.iter().enumerate() {
            for face_idx in 0..element.shape.num_faces() {
                face_map
                    .entry((element.level, element.face_key(face_idx)))
                    .or_default()
                    .push((elem_idx, face_idx));
            }
        }

        for element in self.elements.iter_mut() {
            element.neighbors.iter_mut().for_each(|n| *n = None);
        }

        for sharing in face_map.values() {
            match sharing.as_slice() {
                [_] => (),
                [(elem_a, face_a), (elem_b, face_b)] => {
                    let (id_a, id_b) = (self.elements[*elem_a].id, self.elements[*elem_b].id);
                    self.elements[*elem_a].neighbors[*face_a] = Some(id_b);
                    self.elements[*elem_b].neighbors[*face_b] = Some(id_a);
                }
                _ => return Err(MeshError::NonManifoldFace(self.elements[sharing[0].0].id)),
            }
        }

        Ok(())
    }

    // ----------------------------------------------------------------------------------------------------
    // General Data Retrieval
    // ----------------------------------------------------------------------------------------------------

    /// Get an Element by its global id
    pub fn element(&self, id: ElementId) -> Result<&Element, MeshError> {
        self.local_index(id)
            .map(|idx| &self.elements[idx])
            .ok_or(MeshError::ElementDoesntExist(id))
    }

    /// Coordinates of a Node by its global id
    pub fn node_coords(&self, id: NodeId) -> Option<&Point3<f64>> {
        self.node_index.get(&id).map(|idx| &self.nodes[*idx].coords)
    }

    /// Get a list of an Element's descendant ids (resident descendants only)
    pub fn descendant_elements(
        &self,
        id: ElementId,
        include_starting_element: bool,
    ) -> Result<Vec<ElementId>, MeshError> {
        let idx = self
            .local_index(id)
            .ok_or(MeshError::ElementDoesntExist(id))?;
        let mut descendants = Vec::new();
        self.rec_descendants(idx, include_starting_element, &mut descendants);
        Ok(descendants)
    }

    fn rec_descendants(&self, idx: usize, include: bool, desc: &mut Vec<ElementId>) {
        if include {
            desc.push(self.elements[idx].id);
        }
        for son_idx in self.elements[idx]
            .sons
            .iter()
            .filter_map(|son_id| self.local_index(*son_id))
        {
            self.rec_descendants(son_idx, true, desc);
        }
    }

    /// Elements without sons (the ones drawn by a plot)
    pub fn leaves(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements.iter().filter(|element| !element.has_sons())
    }

    // ----------------------------------------------------------------------------------------------------
    // Distribution
    // ----------------------------------------------------------------------------------------------------

    /// Split this Mesh into one Mesh per process
    ///
    /// `owners[i]` is the rank owning `self.elements[i]`. Element and Node ids are preserved; Nodes
    /// are duplicated on every rank that references them. Fathers, sons and neighbors living on
    /// other ranks remain referenced by id and are recorded with their owning rank.
    pub fn partition(&self, owners: &[usize]) -> Result<Vec<Mesh>, MeshError> {
        if owners.len() != self.elements.len() {
            return Err(MeshError::OwnerCountMismatch(
                owners.len(),
                self.elements.len(),
            ));
        }
        let num_ranks = owners.iter().max().map_or(1, |max| max + 1);
        let owner_by_id: HashMap<ElementId, usize> = self
            .elements
            .iter()
            .zip(owners.iter())
            .map(|(element, owner)| (element.id, *owner))
            .collect();

        let mut parts: Vec<Mesh> = (0..num_ranks)
            .map(|rank| Mesh {
                rank,
                ..Mesh::blank()
            })
            .collect();

        for (element, owner) in self.elements.iter().zip(owners.iter()) {
            let part = &mut parts[*owner];

            for node_id in element.nodes.iter() {
                if !part.node_index.contains_key(node_id) {
                    let node = &self.nodes[self.node_index[node_id]];
                    part.node_index.insert(*node_id, part.nodes.len());
                    part.nodes.push(node.clone());
                }
            }

            let referenced = element
                .neighbors
                .iter()
                .flatten()
                .chain(element.father.iter())
                .chain(element.sons.iter());
            for other in referenced {
                let other_owner = owner_by_id[other];
                if other_owner != *owner {
                    part.remote_owners.insert(*other, other_owner);
                }
            }

            part.element_index.insert(element.id, part.elements.len());
            part.elements.push(element.clone());
        }

        Ok(parts)
    }

    /// Does an Element referenced from this Mesh live on another process
    pub fn is_remote(&self, id: ElementId) -> bool {
        self.remote_owners.contains_key(&id)
    }
}

impl MeshAccess for Mesh {
    fn num_elements(&self) -> usize {
        self.elements.len()
    }

    fn elements_on_level(&self, level: u8) -> Vec<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.level == level)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn max_level(&self) -> u8 {
        self.elements.iter().map(|e| e.level).max().unwrap_or(0)
    }

    fn shape(&self, elem: usize) -> ElementShape {
        self.elements[elem].shape
    }

    fn corners(&self, elem: usize) -> SmallVec<[Point3<f64>; 8]> {
        self.elements[elem]
            .nodes
            .iter()
            .map(|node_id| self.nodes[self.node_index[node_id]].coords)
            .collect()
    }

    fn corner_ids(&self, elem: usize) -> &[NodeId] {
        &self.elements[elem].nodes
    }

    fn neighbor_across_face(&self, elem: usize, face: usize) -> Option<ElementId> {
        self.elements[elem].neighbor(face)
    }

    fn father(&self, elem: usize) -> Option<ElementId> {
        self.elements[elem].father
    }

    fn sons(&self, elem: usize) -> &[ElementId] {
        &self.elements[elem].sons
    }

    fn level(&self, elem: usize) -> u8 {
        self.elements[elem].level
    }

    fn global_id(&self, elem: usize) -> ElementId {
        self.elements[elem].id
    }

    fn local_index(&self, id: ElementId) -> Option<usize> {
        self.element_index.get(&id).copied()
    }

    fn owner_of(&self, id: ElementId) -> Option<usize> {
        if self.element_index.contains_key(&id) {
            Some(self.rank)
        } else {
            self.remote_owners.get(&id).copied()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use smallvec::smallvec;

    /// Two unit hexahedra side by side along x
    pub(crate) fn two_hex_mesh() -> Mesh {
        let mut mesh = Mesh::blank();
        for z in [0.0, 1.0] {
            for y in [0.0, 1.0] {
                for x in [0.0, 1.0, 2.0] {
                    mesh.add_node(Point3::new(x, y, z));
                }
            }
        }
        // node id = x + 3y + 6z
        mesh.add_element(
            ElementShape::Hexahedron,
            smallvec![0, 1, 4, 3, 6, 7, 10, 9],
            None,
        )
        .unwrap();
        mesh.add_element(
            ElementShape::Hexahedron,
            smallvec![1, 2, 5, 4, 7, 8, 11, 10],
            None,
        )
        .unwrap();
        mesh.connect_faces().unwrap();
        mesh
    }

    #[test]
    fn mesh_from_json() {
        let mesh = Mesh::from_json(
            r#"{
                "Nodes": [[0,0,0],[1,0,0],[1,1,0],[0,1,0],[0.5,0.5,1],[0.5,0.5,2]],
                "Elements": [
                    { "shape": "pyramid", "node_ids": [0, 1, 2, 3, 4] },
                    { "node_ids": [1, 2, 4, 5] }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(mesh.elements.len(), 2);
        assert_eq!(mesh.elements[1].shape, ElementShape::Tetrahedron);
        // pyramid face 2 (1, 2, 4) is tetrahedron face 0 (1, 4, 2)
        assert_eq!(mesh.elements[0].neighbor(2), Some(1));
        assert_eq!(mesh.elements[1].neighbor(0), Some(0));
        assert_eq!(
            mesh.elements[0].neighbors().iter().flatten().count(),
            1,
            "only one shared face"
        );
    }

    #[test]
    fn bad_mesh_files() {
        assert!(matches!(
            Mesh::from_json("{ not json"),
            Err(MeshError::Json(_))
        ));
        assert_eq!(
            Mesh::from_json(r#"{ "Elements": [] }"#).unwrap_err(),
            MeshError::MissingEntry("Nodes")
        );
        assert_eq!(
            Mesh::from_json(r#"{ "Nodes": [[0,0,0]], "Elements": [{ "node_ids": [0, 0, 0] }] }"#)
                .unwrap_err(),
            MeshError::BadCornerCount(0, 3)
        );
        assert_eq!(
            Mesh::from_json(r#"{ "Nodes": [[0,0,0]], "Elements": [{ "node_ids": [0, 1, 2, 3] }] }"#)
                .unwrap_err(),
            MeshError::NodeDoesntExist(0, 1)
        );
    }

    #[test]
    fn hex_neighbors() {
        let mesh = two_hex_mesh();
        // face 2 of element 0 is x = 1, face 4 of element 1 is x = 1
        assert_eq!(mesh.elements[0].neighbor(2), Some(1));
        assert_eq!(mesh.elements[1].neighbor(4), Some(0));
        assert_eq!(mesh.elements[0].neighbor(4), None);
    }

    #[test]
    fn non_manifold_face() {
        let mut mesh = Mesh::blank();
        for p in [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
            [1.0, 1.0, 1.0],
        ] {
            mesh.add_node(Point3::from(p));
        }
        for apex in [3, 4, 5] {
            mesh.add_element(ElementShape::Tetrahedron, smallvec![0, 1, 2, apex], None)
                .unwrap();
        }
        assert!(matches!(
            mesh.connect_faces(),
            Err(MeshError::NonManifoldFace(_))
        ));
    }

    #[test]
    fn partition_keeps_references() {
        let mesh = two_hex_mesh();
        let parts = mesh.partition(&[0, 1]).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].rank, 1);
        assert_eq!(parts[0].elements.len(), 1);
        assert_eq!(parts[0].nodes.len(), 8);
        assert_eq!(parts[0].neighbor_across_face(0, 2), Some(1));
        assert!(parts[0].is_remote(1));
        assert_eq!(parts[0].owner_of(1), Some(1));
        assert_eq!(parts[0].owner_of(0), Some(0));
        assert_eq!(parts[1].local_index(1), Some(0));
        assert_eq!(parts[1].local_index(0), None);

        assert_eq!(
            mesh.partition(&[0]).unwrap_err(),
            MeshError::OwnerCountMismatch(1, 2)
        );
    }
}
