use smallvec::{Array, SmallVec};

/// Allocation failure during an ordering pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ordering pass ran out of memory: requested {requested} entries with {available} of {capacity} available")]
pub struct OutOfMemory {
    pub requested: usize,
    pub available: usize,
    pub capacity: usize,
}

/// Allocation budget for the temporary graph storage of one ordering pass
///
/// Every graph entry (node, back-edge, hash table slot) is charged against a fixed capacity.
/// Exhausting the budget, or a failed reservation from the allocator, is reported as [`OutOfMemory`].
/// The storage itself is owned by the structures built during the pass and freed with them.
#[derive(Debug)]
pub struct PassArena {
    capacity: usize,
    used: usize,
}

impl PassArena {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries charged so far
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    fn exhausted(&self, requested: usize) -> OutOfMemory {
        OutOfMemory {
            requested,
            available: self.available(),
            capacity: self.capacity,
        }
    }

    /// The current usage, to be passed to [`PassArena::release`] once the storage charged after it is freed
    pub fn mark(&self) -> usize {
        self.used
    }

    /// Return everything charged since `mark` to the budget
    pub fn release(&mut self, mark: usize) {
        self.used = self.used.min(mark);
    }

    /// Charge `entries` against the budget
    pub fn charge(&mut self, entries: usize) -> Result<(), OutOfMemory> {
        if entries > self.available() {
            return Err(self.exhausted(entries));
        }
        self.used += entries;
        Ok(())
    }

    /// Allocate an empty Vec with room for `len` entries
    pub fn vec<T>(&mut self, len: usize) -> Result<Vec<T>, OutOfMemory> {
        self.charge(len)?;
        let mut v = Vec::new();
        v.try_reserve_exact(len).map_err(|_| self.exhausted(len))?;
        Ok(v)
    }

    /// Allocate a Vec holding `len` copies of `value`
    pub fn filled<T: Clone>(&mut self, len: usize, value: T) -> Result<Vec<T>, OutOfMemory> {
        let mut v = self.vec(len)?;
        v.resize(len, value);
        Ok(v)
    }

    /// Append an entry to a list, charging it against the budget
    pub fn push<A: Array>(&mut self, list: &mut SmallVec<A>, item: A::Item) -> Result<(), OutOfMemory> {
        self.charge(1)?;
        list.try_reserve(1).map_err(|_| self.exhausted(1))?;
        list.push(item);
        Ok(())
    }
}
