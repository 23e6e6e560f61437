use super::{ElementId, NodeId};
use json::{object, JsonValue};
use smallvec::SmallVec;
use std::fmt;

/// The four 3D cell shapes an [`Element`] can take
///
/// ## Layout
/// Corner and face indices follow these reference cells (`b` marks the bottom face, `t` the top):
///
/// ```text
///  Tetrahedron        Pyramid             Prism               Hexahedron
///                         4                   5                  7 ------- 6
///       3                / \                / |\                /|        /|
///      /|\              /   \              3 -+- 4             4 ------- 5 |
///     / | \            3 -.- 2             |  2  |             | 3 -----|- 2
///    0 -|- 2          /     /              | / \ |             |/       |/
///     \ | /          0 --- 1               0 --- 1             0 ------- 1
///       1
/// ```
///
/// Face corner lists are listed so that they trace the face boundary; their winding is not relied upon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementShape {
    Tetrahedron,
    Pyramid,
    Prism,
    Hexahedron,
}

const TET_FACES: [&[usize]; 4] = [&[0, 2, 1], &[0, 1, 3], &[1, 2, 3], &[0, 3, 2]];
const PYR_FACES: [&[usize]; 5] = [&[0, 3, 2, 1], &[0, 1, 4], &[1, 2, 4], &[2, 3, 4], &[3, 0, 4]];
const PRI_FACES: [&[usize]; 5] = [
    &[0, 2, 1],
    &[0, 1, 4, 3],
    &[1, 2, 5, 4],
    &[2, 0, 3, 5],
    &[3, 4, 5],
];
const HEX_FACES: [&[usize]; 6] = [
    &[0, 3, 2, 1],
    &[0, 1, 5, 4],
    &[1, 2, 6, 5],
    &[2, 3, 7, 6],
    &[3, 0, 4, 7],
    &[4, 5, 6, 7],
];

const TET_EDGES: [[usize; 2]; 6] = [[0, 1], [1, 2], [2, 0], [0, 3], [1, 3], [2, 3]];
const PYR_EDGES: [[usize; 2]; 8] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [0, 4],
    [1, 4],
    [2, 4],
    [3, 4],
];
const PRI_EDGES: [[usize; 2]; 9] = [
    [0, 1],
    [1, 2],
    [2, 0],
    [0, 3],
    [1, 4],
    [2, 5],
    [3, 4],
    [4, 5],
    [5, 3],
];
const HEX_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
];

impl ElementShape {
    pub fn num_corners(&self) -> usize {
        match self {
            Self::Tetrahedron => 4,
            Self::Pyramid => 5,
            Self::Prism => 6,
            Self::Hexahedron => 8,
        }
    }

    pub fn num_faces(&self) -> usize {
        self.faces().len()
    }

    /// Corner indices of every face
    pub fn faces(&self) -> &'static [&'static [usize]] {
        match self {
            Self::Tetrahedron => &TET_FACES,
            Self::Pyramid => &PYR_FACES,
            Self::Prism => &PRI_FACES,
            Self::Hexahedron => &HEX_FACES,
        }
    }

    /// Corner indices of a single face
    pub fn face(&self, face_idx: usize) -> &'static [usize] {
        self.faces()[face_idx]
    }

    /// Corner index pairs of every edge
    pub fn edges(&self) -> &'static [[usize; 2]] {
        match self {
            Self::Tetrahedron => &TET_EDGES,
            Self::Pyramid => &PYR_EDGES,
            Self::Prism => &PRI_EDGES,
            Self::Hexahedron => &HEX_EDGES,
        }
    }

    pub fn is_simplex(&self) -> bool {
        matches!(self, Self::Tetrahedron)
    }

    /// Identify a shape from its corner count
    pub fn from_num_corners(n: usize) -> Option<Self> {
        match n {
            4 => Some(Self::Tetrahedron),
            5 => Some(Self::Pyramid),
            6 => Some(Self::Prism),
            8 => Some(Self::Hexahedron),
            _ => None,
        }
    }

    /// Parse the name used in mesh files
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tetrahedron" | "tet" => Some(Self::Tetrahedron),
            "pyramid" | "pyr" => Some(Self::Pyramid),
            "prism" | "pri" => Some(Self::Prism),
            "hexahedron" | "hex" => Some(Self::Hexahedron),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tetrahedron => "tetrahedron",
            Self::Pyramid => "pyramid",
            Self::Prism => "prism",
            Self::Hexahedron => "hexahedron",
        }
    }
}

impl fmt::Display for ElementShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// `Element`s are the basic geometric unit of the [`Mesh`](super::Mesh)
///
/// `Element`s are responsible for keeping track of:
/// * Their corner `Node`s (in the order given by their [`ElementShape`])
/// * The `Element` across each of their faces (`None` on the domain boundary)
/// * Connections to their father `Element` and son `Element`s (h-refinement state)
///
/// All connections are stored as global [`ElementId`]s; the referenced `Element`s need not be resident in the same `Mesh`
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub shape: ElementShape,
    pub nodes: SmallVec<[NodeId; 8]>,
    pub level: u8,
    pub(crate) neighbors: SmallVec<[Option<ElementId>; 6]>,
    pub(crate) father: Option<ElementId>,
    pub(crate) sons: SmallVec<[ElementId; 8]>,
}

impl Element {
    pub fn new(
        id: ElementId,
        shape: ElementShape,
        nodes: SmallVec<[NodeId; 8]>,
        father: Option<ElementId>,
        level: u8,
    ) -> Self {
        Self {
            id,
            shape,
            neighbors: SmallVec::from_elem(None, shape.num_faces()),
            nodes,
            level,
            father,
            sons: SmallVec::new(),
        }
    }

    /// Id of the father Element if this Element was created through refinement
    pub fn father_id(&self) -> Option<ElementId> {
        self.father
    }

    /// Ids of this Element's sons (empty if it has not been refined)
    pub fn son_ids(&self) -> &[ElementId] {
        &self.sons
    }

    pub fn has_sons(&self) -> bool {
        !self.sons.is_empty()
    }

    /// The Element across a face (if any)
    pub fn neighbor(&self, face_idx: usize) -> Option<ElementId> {
        self.neighbors.get(face_idx).copied().flatten()
    }

    pub fn neighbors(&self) -> &[Option<ElementId>] {
        &self.neighbors
    }

    /// Global Node ids of a face's corners (in reference order)
    pub fn face_nodes(&self, face_idx: usize) -> SmallVec<[NodeId; 4]> {
        self.shape
            .face(face_idx)
            .iter()
            .map(|corner| self.nodes[*corner])
            .collect()
    }

    /// The face key used to match faces between neighboring Elements (sorted node ids)
    pub(crate) fn face_key(&self, face_idx: usize) -> SmallVec<[NodeId; 4]> {
        let mut key = self.face_nodes(face_idx);
        key.sort_unstable();
        key
    }

    /// Produce a Json Object that describes this Element
    pub fn to_json(&self) -> JsonValue {
        object! {
            "id": self.id,
            "shape": self.shape.name(),
            "level": self.level,
            "father": self.father,
            "node_ids": JsonValue::from(self.nodes.to_vec()),
            "sons": JsonValue::from(self.sons.to_vec()),
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Element {} ({}, level {}) nodes: {:?}",
            self.id,
            self.shape,
            self.level,
            self.nodes.as_slice()
        )
    }
}
