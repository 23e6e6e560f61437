use super::slot::{CandidateRecord, SlotError};
use crate::arena::{OutOfMemory, PassArena};
use crate::mesh::ElementId;
use crate::occlusion::{occlusion_edges, OcclusionCandidate, PairSearch};
use crate::shell::ShellGraph;
use smallvec::SmallVec;

const EMPTY: u32 = u32::MAX;

/// The sons of one father, gathered from the ranks that own them
///
/// Sons are keyed by global id in a fixed-capacity open-addressing table (linear probing, capacity a
/// power of two of at least twice the number of sons). Entries keep the father's son order, and once
/// every record has arrived the table doubles as the sons' occlusion graph.
#[derive(Debug)]
pub struct SonTable {
    slots: Vec<u32>,
    ids: Vec<ElementId>,
    records: Vec<Option<CandidateRecord>>,
    owners: Vec<usize>,
    in_degree: Vec<u32>,
    back_edges: Vec<SmallVec<[u32; 4]>>,
}

impl SonTable {
    /// An empty table for a father's sons (in the father's son order)
    pub fn with_sons(sons: &[ElementId], arena: &mut PassArena) -> Result<Self, OutOfMemory> {
        let capacity = (2 * sons.len()).next_power_of_two().max(2);
        let mut table = Self {
            slots: arena.filled(capacity, EMPTY)?,
            ids: arena.vec(sons.len())?,
            records: arena.filled(sons.len(), None)?,
            owners: arena.filled(sons.len(), 0)?,
            in_degree: arena.filled(sons.len(), 0)?,
            back_edges: arena.filled(sons.len(), SmallVec::new())?,
        };
        for son in sons {
            let slot = table.slot_of(*son);
            if table.slots[slot] == EMPTY {
                table.slots[slot] = table.ids.len() as u32;
                table.ids.push(*son);
            }
        }
        Ok(table)
    }

    fn hash(&self, id: ElementId) -> usize {
        (id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & (self.slots.len() - 1)
    }

    // the slot holding `id`, or the empty slot where it would go
    fn slot_of(&self, id: ElementId) -> usize {
        let mask = self.slots.len() - 1;
        let mut slot = self.hash(id);
        while self.slots[slot] != EMPTY && self.ids[self.slots[slot] as usize] != id {
            slot = (slot + 1) & mask;
        }
        slot
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Entry index of a son
    pub fn index_of(&self, id: ElementId) -> Option<u32> {
        match self.slots[self.slot_of(id)] {
            EMPTY => None,
            entry => Some(entry),
        }
    }

    pub fn id(&self, entry: u32) -> ElementId {
        self.ids[entry as usize]
    }

    /// Rank owning a son (once its record has arrived)
    pub fn owner(&self, entry: u32) -> usize {
        self.owners[entry as usize]
    }

    pub fn size(&self, entry: u32) -> Option<u32> {
        self.records[entry as usize].as_ref().map(|r| r.size)
    }

    /// Store the record of a son owned by `owner`
    pub fn insert(&mut self, record: CandidateRecord, owner: usize) -> Result<(), SlotError> {
        let id = record.candidate.id;
        let entry = self.index_of(id).ok_or(SlotError::UnknownElement(id))? as usize;
        if self.records[entry].is_some() {
            return Err(SlotError::DuplicateRecord(id));
        }
        self.records[entry] = Some(record);
        self.owners[entry] = owner;
        Ok(())
    }

    /// The first son whose record hasn't arrived
    pub fn missing(&self) -> Option<ElementId> {
        self.records
            .iter()
            .position(Option::is_none)
            .map(|entry| self.ids[entry])
    }

    /// Derive the sons' occlusion relation by pairwise tests, returning the number of edges
    ///
    /// Every record must have arrived (see [`SonTable::missing`]).
    pub fn link(&mut self, eps: f64, arena: &mut PassArena) -> Result<usize, OutOfMemory> {
        let candidates: Vec<OcclusionCandidate> = self
            .records
            .iter()
            .flatten()
            .map(|r| r.candidate.clone())
            .collect();

        let edges = occlusion_edges(&candidates, PairSearch::Pairwise, eps);
        for (occluder, occluded) in edges.iter() {
            arena.push(&mut self.back_edges[*occluder as usize], *occluded)?;
            self.in_degree[*occluded as usize] += 1;
        }
        Ok(edges.len())
    }
}

impl ShellGraph for SonTable {
    fn num_nodes(&self) -> usize {
        self.ids.len()
    }

    fn in_degree(&self, node: u32) -> u32 {
        self.in_degree[node as usize]
    }

    fn back_edges(&self, node: u32) -> &[u32] {
        &self.back_edges[node as usize]
    }
}
