use crate::arena::OutOfMemory;
use crate::geometry::{ProjectedPoint, ScreenBox};
use crate::mesh::ElementId;
use crate::occlusion::{OcclusionCandidate, ProjectedFace};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Bytes taken by a slot header: kind, flags, record count, origin rank, auxiliary word
pub const HEADER_LEN: usize = 12;

/// More slots of the same stream follow
pub const MORE: u8 = 0b01;
/// Final slot of a stream
pub const LAST: u8 = 0b10;

const NO_NEIGHBOR: u64 = u64::MAX;
const CANDIDATE_FIXED_LEN: usize = 8 + 4 + 4 * 8 + 2 * 8 + 1;
const FACE_FIXED_LEN: usize = 1 + 1 + 8;
const CORNER_LEN: usize = 3 * 8;
const PAIR_LEN: usize = 8 + 4;

/// Malformed or undeliverable messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot of {0} bytes is shorter than its header")]
    Truncated(usize),
    #[error("unknown slot kind {0}")]
    UnknownKind(u8),
    #[error("expected a {expected:?} slot from rank {origin}, received {found:?}")]
    UnexpectedKind {
        expected: SlotKind,
        found: SlotKind,
        origin: usize,
    },
    #[error("{kind:?} slot from rank {origin} overruns its records")]
    RecordOverrun { kind: SlotKind, origin: usize },
    #[error("record of {0} bytes doesn't fit in a slot of {1} bytes")]
    RecordTooLarge(usize, usize),
    #[error("face record with {0} corners")]
    BadFace(u8),
    #[error("unknown verdict code {0}")]
    BadVerdict(u32),
    #[error("rank {0} disconnected")]
    Disconnected(usize),
    #[error("Element {0} is not resident on the receiving rank")]
    UnknownElement(ElementId),
    #[error("no record received for son {0}")]
    MissingSon(ElementId),
    #[error("duplicate record for Element {0}")]
    DuplicateRecord(ElementId),
}

/// The message type carried by a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotKind {
    /// Maximum refinement level (in the auxiliary word)
    Census = 1,
    /// `(father, subtree size)` pairs
    Sizes = 2,
    /// Coarse occlusion candidates with their subtree sizes
    Candidates = 3,
    /// Outcome of the coordinator's ordering (code in the auxiliary word)
    Verdict = 4,
    /// `(coarse Element, plot offset)` pairs
    Offsets = 5,
    /// Son candidates sent to their father's owner
    SonRecords = 6,
    /// `(son, plot position)` pairs sent back to the son's owner
    SonPositions = 7,
}

impl SlotKind {
    fn from_u8(kind: u8) -> Result<Self, SlotError> {
        Ok(match kind {
            1 => Self::Census,
            2 => Self::Sizes,
            3 => Self::Candidates,
            4 => Self::Verdict,
            5 => Self::Offsets,
            6 => Self::SonRecords,
            7 => Self::SonPositions,
            _ => return Err(SlotError::UnknownKind(kind)),
        })
    }
}

/// A coarse or son candidate together with the size of its refinement subtree
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateRecord {
    pub candidate: OcclusionCandidate,
    pub size: u32,
}

impl CandidateRecord {
    fn encoded_len(&self) -> usize {
        CANDIDATE_FIXED_LEN
            + self
                .candidate
                .faces
                .iter()
                .map(|face| FACE_FIXED_LEN + face.corners.len() * CORNER_LEN)
                .sum::<usize>()
    }

    fn encode(&self, buf: &mut BytesMut) {
        let c = &self.candidate;
        buf.put_u64(c.id);
        buf.put_u32(self.size);
        buf.put_f64(c.bbox.u_min);
        buf.put_f64(c.bbox.u_max);
        buf.put_f64(c.bbox.v_min);
        buf.put_f64(c.bbox.v_max);
        buf.put_f64(c.depth_min);
        buf.put_f64(c.depth_max);
        buf.put_u8(c.faces.len() as u8);
        for face in c.faces.iter() {
            buf.put_u8(face.corners.len() as u8);
            buf.put_u8(face.visible as u8);
            buf.put_u64(face.neighbor.unwrap_or(NO_NEIGHBOR));
            for corner in face.corners.iter() {
                buf.put_f64(corner.screen.x);
                buf.put_f64(corner.screen.y);
                buf.put_f64(corner.depth);
            }
        }
    }

    fn decode(buf: &mut Bytes, overrun: SlotError) -> Result<Self, SlotError> {
        need(buf, CANDIDATE_FIXED_LEN, &overrun)?;
        let id = buf.get_u64();
        let size = buf.get_u32();
        let bbox = ScreenBox {
            u_min: buf.get_f64(),
            u_max: buf.get_f64(),
            v_min: buf.get_f64(),
            v_max: buf.get_f64(),
        };
        let depth_min = buf.get_f64();
        let depth_max = buf.get_f64();
        let num_faces = buf.get_u8();

        let mut faces = SmallVec::new();
        for _ in 0..num_faces {
            need(buf, FACE_FIXED_LEN, &overrun)?;
            let num_corners = buf.get_u8();
            if !(3..=4).contains(&num_corners) {
                return Err(SlotError::BadFace(num_corners));
            }
            let visible = buf.get_u8() != 0;
            let neighbor = match buf.get_u64() {
                NO_NEIGHBOR => None,
                id => Some(id),
            };
            need(buf, num_corners as usize * CORNER_LEN, &overrun)?;
            let corners = (0..num_corners)
                .map(|_| ProjectedPoint::new(buf.get_f64(), buf.get_f64(), buf.get_f64()))
                .collect();
            faces.push(ProjectedFace {
                corners,
                visible,
                neighbor,
            });
        }

        Ok(Self {
            candidate: OcclusionCandidate {
                id,
                bbox,
                depth_min,
                depth_max,
                faces,
            },
            size,
        })
    }
}

/// A son's candidate record addressed to its father
#[derive(Clone, Debug, PartialEq)]
pub struct SonRecord {
    pub father: ElementId,
    pub record: CandidateRecord,
}

/// Outcome of the coordinator's coarse ordering, broadcast ahead of the plot offsets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Ordered,
    NoFirstShell,
    UntractableCycle,
    OutOfMemory(OutOfMemory),
    /// Ordering was skipped because of a failure every rank detected on its own
    Skipped,
}

impl Verdict {
    fn code(&self) -> u32 {
        match self {
            Self::Ordered => 0,
            Self::NoFirstShell => 1,
            Self::UntractableCycle => 2,
            Self::OutOfMemory(_) => 3,
            Self::Skipped => 4,
        }
    }
}

fn need(buf: &Bytes, len: usize, overrun: &SlotError) -> Result<(), SlotError> {
    if buf.remaining() < len {
        Err(overrun.clone())
    } else {
        Ok(())
    }
}

/// A received slot, with its header decoded
#[derive(Clone, Debug)]
pub struct Slot {
    pub kind: SlotKind,
    pub flags: u8,
    pub count: u16,
    pub origin: usize,
    pub aux: u32,
    raw: Bytes,
}

impl Slot {
    pub fn decode(raw: Bytes) -> Result<Self, SlotError> {
        if raw.len() < HEADER_LEN {
            return Err(SlotError::Truncated(raw.len()));
        }
        let mut header = raw.slice(..HEADER_LEN);
        let kind = SlotKind::from_u8(header.get_u8())?;
        Ok(Self {
            kind,
            flags: header.get_u8(),
            count: header.get_u16(),
            origin: header.get_u32() as usize,
            aux: header.get_u32(),
            raw,
        })
    }

    pub fn is_last(&self) -> bool {
        self.flags & LAST != 0
    }

    /// Fail unless this slot is of the `expected` kind
    pub fn expect(&self, expected: SlotKind) -> Result<(), SlotError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(SlotError::UnexpectedKind {
                expected,
                found: self.kind,
                origin: self.origin,
            })
        }
    }

    /// The encoded slot, unchanged
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// A copy of the encoded slot with different flags (for relaying a stream as part of another)
    pub fn relabeled(&self, flags: u8) -> Bytes {
        let mut copy = BytesMut::from(&self.raw[..]);
        copy[1] = flags;
        copy.freeze()
    }

    fn records(&self) -> Bytes {
        self.raw.slice(HEADER_LEN..)
    }

    fn overrun(&self) -> SlotError {
        SlotError::RecordOverrun {
            kind: self.kind,
            origin: self.origin,
        }
    }

    /// `(Element id, value)` records of a Sizes, Offsets or SonPositions slot
    pub fn pairs(&self) -> Result<Vec<(ElementId, u32)>, SlotError> {
        let mut buf = self.records();
        need(&buf, self.count as usize * PAIR_LEN, &self.overrun())?;
        Ok((0..self.count)
            .map(|_| (buf.get_u64(), buf.get_u32()))
            .collect())
    }

    pub fn candidates(&self) -> Result<Vec<CandidateRecord>, SlotError> {
        let mut buf = self.records();
        let overrun = self.overrun();
        (0..self.count)
            .map(|_| CandidateRecord::decode(&mut buf, overrun.clone()))
            .collect()
    }

    pub fn son_records(&self) -> Result<Vec<SonRecord>, SlotError> {
        let mut buf = self.records();
        let overrun = self.overrun();
        (0..self.count)
            .map(|_| {
                need(&buf, 8, &overrun)?;
                let father = buf.get_u64();
                let record = CandidateRecord::decode(&mut buf, overrun.clone())?;
                Ok(SonRecord { father, record })
            })
            .collect()
    }

    pub fn verdict(&self) -> Result<Verdict, SlotError> {
        Ok(match self.aux {
            0 => Verdict::Ordered,
            1 => Verdict::NoFirstShell,
            2 => Verdict::UntractableCycle,
            3 => {
                let mut buf = self.records();
                need(&buf, 24, &self.overrun())?;
                Verdict::OutOfMemory(OutOfMemory {
                    requested: buf.get_u64() as usize,
                    available: buf.get_u64() as usize,
                    capacity: buf.get_u64() as usize,
                })
            }
            4 => Verdict::Skipped,
            code => return Err(SlotError::BadVerdict(code)),
        })
    }
}

/// Packs a stream of records into fixed-size slots
///
/// Every slot but the last is flagged [`MORE`]; an empty stream still produces one (empty) slot.
pub struct SlotWriter {
    kind: SlotKind,
    origin: u32,
    aux: u32,
    slot_size: usize,
    body: BytesMut,
    count: u16,
    sealed: Vec<Bytes>,
}

impl SlotWriter {
    pub fn new(kind: SlotKind, origin: usize, aux: u32, slot_size: usize) -> Self {
        Self {
            kind,
            origin: origin as u32,
            aux,
            slot_size,
            body: BytesMut::with_capacity(slot_size - HEADER_LEN),
            count: 0,
            sealed: Vec::new(),
        }
    }

    fn seal(&mut self, flags: u8) -> Bytes {
        let mut slot = BytesMut::with_capacity(self.slot_size);
        slot.put_u8(self.kind as u8);
        slot.put_u8(flags);
        slot.put_u16(self.count);
        slot.put_u32(self.origin);
        slot.put_u32(self.aux);
        slot.extend_from_slice(&self.body);
        slot.resize(self.slot_size, 0);
        self.body.clear();
        self.count = 0;
        slot.freeze()
    }

    // make room for a record of `len` bytes, starting a new slot if needed
    fn reserve(&mut self, len: usize) -> Result<(), SlotError> {
        if HEADER_LEN + len > self.slot_size {
            return Err(SlotError::RecordTooLarge(len, self.slot_size));
        }
        if HEADER_LEN + self.body.len() + len > self.slot_size || self.count == u16::MAX {
            let slot = self.seal(MORE);
            self.sealed.push(slot);
        }
        self.count += 1;
        Ok(())
    }

    pub fn pair(&mut self, id: ElementId, value: u32) -> Result<(), SlotError> {
        self.reserve(PAIR_LEN)?;
        self.body.put_u64(id);
        self.body.put_u32(value);
        Ok(())
    }

    pub fn candidate(&mut self, record: &CandidateRecord) -> Result<(), SlotError> {
        self.reserve(record.encoded_len())?;
        record.encode(&mut self.body);
        Ok(())
    }

    pub fn son_record(&mut self, record: &SonRecord) -> Result<(), SlotError> {
        self.reserve(8 + record.record.encoded_len())?;
        self.body.put_u64(record.father);
        record.record.encode(&mut self.body);
        Ok(())
    }

    /// Seal the stream, flagging its final slot with `flags`
    pub fn finish_with(mut self, flags: u8) -> Vec<Bytes> {
        let slot = self.seal(flags);
        self.sealed.push(slot);
        self.sealed
    }

    /// Seal the stream, flagging its final slot [`LAST`]
    pub fn finish(self) -> Vec<Bytes> {
        self.finish_with(LAST)
    }
}

/// A single-slot Census stream
pub fn census(origin: usize, level: u8, slot_size: usize) -> Bytes {
    let mut slots = SlotWriter::new(SlotKind::Census, origin, level as u32, slot_size).finish();
    slots.remove(0)
}

/// A single Verdict slot; `flags` is [`MORE`] when it opens the offset broadcast, [`LAST`] when it
/// stands alone
pub fn verdict(origin: usize, verdict: Verdict, flags: u8, slot_size: usize) -> Bytes {
    let mut writer = SlotWriter::new(SlotKind::Verdict, origin, verdict.code(), slot_size);
    if let Verdict::OutOfMemory(oom) = verdict {
        writer.count = 1;
        writer.body.put_u64(oom.requested as u64);
        writer.body.put_u64(oom.available as u64);
        writer.body.put_u64(oom.capacity as u64);
    }
    writer.finish_with(flags).remove(0)
}
