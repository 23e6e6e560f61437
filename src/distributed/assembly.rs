use super::network::Endpoint;
use super::remote_sons::SonTable;
use super::slot::{
    self, CandidateRecord, Slot, SlotError, SlotKind, SlotWriter, SonRecord, Verdict, LAST, MORE,
};
use crate::arena::{OutOfMemory, PassArena};
use crate::config::OrderingConfig;
use crate::geometry::ScreenBox;
use crate::hierarchy::{accumulate_level, order_sons, place_block, subtree_sizes};
use crate::mesh::{ElementId, MeshAccess, MeshError};
use crate::occlusion::{build_graph, OcclusionCandidate, PairSearch};
use crate::ordering::{enumeration_positions, ElementAnnotation, OrderError, PassStats, PassStatus};
use crate::shell::{peel, ShellError};
use crate::view::{ViewSignature, ViewSpec, ViewTransform};
use crate::visibility::{classify_all, FaceMask};
use bytes::Bytes;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::task::Poll;

/// Parent of a rank in the spanning tree rooted at the coordinator (rank 0)
pub fn tree_parent(rank: usize, branching_factor: usize) -> Option<usize> {
    (rank > 0).then(|| (rank - 1) / branching_factor)
}

/// Children of a rank in the spanning tree
pub fn tree_children(
    rank: usize,
    branching_factor: usize,
    num_ranks: usize,
) -> impl Iterator<Item = usize> {
    let first = branching_factor * rank + 1;
    (first..first + branching_factor).filter(move |child| *child < num_ranks)
}

/// One process of a distributed ordering pass
///
/// Every rank holds the resident part of a partitioned Mesh (see [`crate::mesh::Mesh::partition`])
/// and one [`Endpoint`] of a shared [`super::Network`]. A pass is started on every rank with
/// [`Rank::begin`] and advanced by polling [`Rank::poll`], which never blocks; [`drive`] polls a set
/// of ranks on one thread and [`Rank::ensure_ordered`] busy-polls a single rank on its own thread.
pub struct Rank<M: MeshAccess> {
    mesh: M,
    endpoint: Endpoint,
    config: OrderingConfig,
    annotations: Vec<ElementAnnotation>,
    cached_view: Option<ViewSignature>,
    build_count: usize,
    last_stats: Option<PassStats>,
    activity: Activity,
}

enum Activity {
    Idle,
    Cached,
    Running(Box<PassState>),
}

impl<M: MeshAccess> Rank<M> {
    /// Set up a rank, checking the configuration and that every Element referenced by a resident
    /// Element has a known owner
    pub fn new(mesh: M, endpoint: Endpoint, config: OrderingConfig) -> Result<Self, OrderError> {
        config.validate()?;
        for elem in 0..mesh.num_elements() {
            let referenced = mesh
                .father(elem)
                .into_iter()
                .chain(mesh.sons(elem).iter().copied())
                .chain((0..mesh.shape(elem).num_faces()).filter_map(|f| mesh.neighbor_across_face(elem, f)));
            for id in referenced {
                mesh.owner_of(id).ok_or(MeshError::ElementDoesntExist(id))?;
            }
        }

        Ok(Self {
            mesh,
            endpoint,
            config,
            annotations: Vec::new(),
            cached_view: None,
            build_count: 0,
            last_stats: None,
            activity: Activity::Idle,
        })
    }

    pub fn rank(&self) -> usize {
        self.endpoint.rank()
    }

    pub fn mesh(&self) -> &M {
        &self.mesh
    }

    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    /// Number of ordering passes started so far
    pub fn build_count(&self) -> usize {
        self.build_count
    }

    /// Statistics from the last completed pass (coarse graph figures are only known on the coordinator)
    pub fn last_stats(&self) -> Option<&PassStats> {
        self.last_stats.as_ref()
    }

    /// Annotation of a resident Element by local index
    pub fn annotation(&self, elem: usize) -> Option<&ElementAnnotation> {
        self.annotations.get(elem)
    }

    pub fn annotations(&self) -> &[ElementAnnotation] {
        &self.annotations
    }

    /// Global plot position of a resident Element
    pub fn plot_position(&self, elem: usize) -> Option<u32> {
        self.annotation(elem).map(|a| a.plot_position)
    }

    /// Local indices of the resident Elements sorted by plot position
    pub fn plot_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.annotations.len()).collect();
        order.sort_by_key(|elem| self.annotations[*elem].plot_position);
        order
    }

    /// Start a pass for a view (every rank must be given the same view)
    ///
    /// Nothing is exchanged if the view's signature matches the last successful pass and `force` is false.
    pub fn begin(&mut self, view: &ViewSpec, force: bool) {
        let signature = view.signature();
        if !force && self.cached_view == Some(signature) {
            self.activity = Activity::Cached;
            return;
        }
        self.cached_view = None;
        self.build_count += 1;
        self.activity = Activity::Running(Box::new(PassState::new(
            &self.mesh,
            &self.config,
            view,
        )));
    }

    /// Make as much progress on the current pass as the links allow
    pub fn poll(&mut self) -> Poll<Result<PassStatus, OrderError>> {
        let mut pass = match std::mem::replace(&mut self.activity, Activity::Idle) {
            Activity::Running(pass) => pass,
            Activity::Idle | Activity::Cached => return Poll::Ready(Ok(PassStatus::Cached)),
        };

        let mut ctx = RankContext {
            mesh: &self.mesh,
            endpoint: &mut self.endpoint,
            config: &self.config,
        };
        match pass.poll(&mut ctx) {
            Ok(false) => {
                self.activity = Activity::Running(pass);
                Poll::Pending
            }
            Ok(true) => Poll::Ready(self.finish(*pass)),
            Err(err) => Poll::Ready(self.abort(err)),
        }
    }

    /// Run a pass to completion on this thread, busy-polling with yields
    pub fn ensure_ordered(&mut self, view: &ViewSpec, force: bool) -> Result<PassStatus, OrderError> {
        self.begin(view, force);
        loop {
            match self.poll() {
                Poll::Ready(result) => return result,
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }

    fn finish(&mut self, pass: PassState) -> Result<PassStatus, OrderError> {
        let PassState {
            signature,
            failure,
            mut annotations,
            positions,
            stats,
            ..
        } = pass;
        for (annotation, position) in annotations.iter_mut().zip(positions) {
            annotation.plot_position = position;
        }
        self.annotations = annotations;
        self.last_stats = Some(stats);

        match failure {
            None => {
                log::info!(
                    "rank {}: ordered {} resident Elements",
                    self.rank(),
                    self.annotations.len()
                );
                self.cached_view = Some(signature);
                Ok(PassStatus::Ordered)
            }
            Some(err) => {
                log::warn!(
                    "rank {}: element ordering failed ({}); drawing in enumeration order",
                    self.rank(),
                    err
                );
                Err(err)
            }
        }
    }

    // the pass can't continue: fall back to the local enumeration order and disconnect, so that
    // peers waiting on this rank fail instead of polling forever
    fn abort(&mut self, err: OrderError) -> Result<PassStatus, OrderError> {
        log::warn!("rank {}: ordering pass aborted ({})", self.rank(), err);
        let positions = enumeration_positions(&self.mesh, &subtree_sizes(&self.mesh));
        self.annotations = positions
            .into_iter()
            .map(|plot_position| ElementAnnotation {
                plot_position,
                ..Default::default()
            })
            .collect();
        self.endpoint.disconnect();
        Err(err)
    }
}

/// Run a pass on every rank, polling them round-robin on the current thread
pub fn drive<M: MeshAccess>(
    ranks: &mut [Rank<M>],
    view: &ViewSpec,
    force: bool,
) -> Vec<Result<PassStatus, OrderError>> {
    ranks.iter_mut().for_each(|rank| rank.begin(view, force));

    let mut results: Vec<Option<Result<PassStatus, OrderError>>> =
        ranks.iter().map(|_| None).collect();
    while results.iter().any(Option::is_none) {
        for (rank, result) in ranks.iter_mut().zip(results.iter_mut()) {
            if result.is_none() {
                if let Poll::Ready(done) = rank.poll() {
                    *result = Some(done);
                }
            }
        }
    }
    results.into_iter().flatten().collect()
}

/// Run a pass with every rank on its own thread
pub fn run_blocking<M: MeshAccess + Send>(
    ranks: Vec<Rank<M>>,
    view: &ViewSpec,
    force: bool,
) -> Vec<(Rank<M>, Result<PassStatus, OrderError>)> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|mut rank| {
                scope.spawn(move || {
                    let result = rank.ensure_ordered(view, force);
                    (rank, result)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

struct RankContext<'a, M: MeshAccess> {
    mesh: &'a M,
    endpoint: &'a mut Endpoint,
    config: &'a OrderingConfig,
}

impl<'a, M: MeshAccess> RankContext<'a, M> {
    fn rank(&self) -> usize {
        self.endpoint.rank()
    }

    fn parent(&self) -> Option<usize> {
        tree_parent(self.rank(), self.config.branching_factor)
    }

    fn children(&self) -> Vec<usize> {
        tree_children(
            self.rank(),
            self.config.branching_factor,
            self.endpoint.num_ranks(),
        )
        .collect()
    }

    fn peers(&self) -> Vec<usize> {
        self.endpoint.peers().collect()
    }

    fn resident(&self, id: ElementId) -> Result<usize, SlotError> {
        self.mesh
            .local_index(id)
            .ok_or(SlotError::UnknownElement(id))
    }

    fn owner(&self, id: ElementId) -> Result<usize, MeshError> {
        self.mesh
            .owner_of(id)
            .ok_or(MeshError::ElementDoesntExist(id))
    }

    // one stream writer per rank (the writer for this rank is never sent)
    fn writers(&self, kind: SlotKind, aux: u32) -> Vec<SlotWriter> {
        (0..self.endpoint.num_ranks())
            .map(|_| SlotWriter::new(kind, self.rank(), aux, self.config.slot_size))
            .collect()
    }

    fn post_streams(&mut self, writers: Vec<SlotWriter>) {
        let rank = self.rank();
        for (peer, writer) in writers.into_iter().enumerate() {
            if peer != rank {
                self.endpoint.post_all(peer, writer.finish());
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    /// Maximum levels flow up the tree
    CensusUp,
    /// The global maximum flows back down
    CensusDown,
    /// Subtree sizes of Elements on a level are sent to remote fathers
    Sizes(u8),
    /// Coarse candidates flow up the tree
    Gather,
    /// The verdict and coarse plot offsets flow down the tree
    Broadcast,
    /// Son records of a level are sent to remote fathers
    SonRecords(u8),
    /// Son positions of a level are sent back to the sons' owners
    SonPositions(u8),
    /// Allocation failures while ordering sons flow up the tree
    OutcomeUp,
    /// The combined outcome flows back down
    OutcomeDown,
    Done,
}

// a father on this rank with sons on other ranks
struct RemoteFather {
    table: SonTable,
    peelable: bool,
}

struct PassState {
    signature: ViewSignature,
    transform: Option<ViewTransform>,
    /// Whole-pass failure: the remaining work follows enumeration order
    failure: Option<OrderError>,
    /// Allocation failure while ordering sons on this rank
    son_oom: Option<OutOfMemory>,
    /// First allocation failure while ordering sons on any rank (see [`Phase::OutcomeUp`])
    outcome: Option<OutOfMemory>,
    /// Has the outcome round run
    settled: bool,
    arena: PassArena,
    annotations: Vec<ElementAnnotation>,
    faces: Vec<FaceMask>,
    sizes: Vec<u32>,
    positions: Vec<u32>,
    top: u8,
    phase: Phase,
    /// Peers whose stream for the current phase hasn't ended
    open: Vec<usize>,
    gathered: Vec<CandidateRecord>,
    remote_fathers: BTreeMap<usize, RemoteFather>,
    stats: PassStats,
}

impl PassState {
    fn new<M: MeshAccess>(mesh: &M, config: &OrderingConfig, view: &ViewSpec) -> Self {
        let n = mesh.num_elements();
        let (transform, failure) = match view.transform() {
            Ok(transform) => (Some(transform), None),
            Err(err) => (None, Some(OrderError::from(err))),
        };

        let annotations: Vec<ElementAnnotation> = match &transform {
            Some(transform) => {
                let all: Vec<usize> = (0..n).collect();
                classify_all(mesh, &all, transform, config.depth_epsilon)
                    .into_iter()
                    .map(|v| ElementAnnotation {
                        faces: v.faces,
                        cut: v.cut,
                        order_code: v.order_code,
                        plot_position: 0,
                    })
                    .collect()
            }
            None => vec![ElementAnnotation::default(); n],
        };
        let faces = annotations.iter().map(|a| a.faces).collect();

        Self {
            signature: view.signature(),
            transform,
            failure,
            son_oom: None,
            outcome: None,
            settled: false,
            arena: PassArena::new(config.arena_capacity),
            annotations,
            faces,
            sizes: vec![1; n],
            positions: vec![0; n],
            top: 0,
            phase: Phase::Start,
            open: Vec::new(),
            gathered: Vec::new(),
            remote_fathers: BTreeMap::new(),
            stats: PassStats::default(),
        }
    }

    /// Advance the pass; true once every phase is complete and every slot has been sent
    fn poll<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) -> Result<bool, OrderError> {
        loop {
            let drained = ctx.endpoint.flush()?;
            if self.phase == Phase::Done {
                return Ok(drained);
            }
            for slot in self.receive(ctx.endpoint)? {
                self.accept(slot, ctx)?;
            }
            if !self.open.is_empty() {
                return Ok(false);
            }
            self.advance(ctx)?;
        }
    }

    fn receive(&mut self, endpoint: &mut Endpoint) -> Result<Vec<Slot>, SlotError> {
        let mut received = Vec::new();
        let mut still_open = Vec::with_capacity(self.open.len());
        for peer in std::mem::take(&mut self.open) {
            let mut closed = false;
            while let Some(raw) = endpoint.try_recv(peer)? {
                let slot = Slot::decode(raw)?;
                closed = slot.is_last();
                received.push(slot);
                if closed {
                    break;
                }
            }
            if !closed {
                still_open.push(peer);
            }
        }
        self.open = still_open;
        Ok(received)
    }

    fn accept<M: MeshAccess>(&mut self, slot: Slot, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        match self.phase {
            Phase::CensusUp | Phase::CensusDown => {
                slot.expect(SlotKind::Census)?;
                self.top = self.top.max(slot.aux.min(u8::MAX as u32) as u8);
            }
            Phase::Sizes(_) => {
                slot.expect(SlotKind::Sizes)?;
                for (father, size) in slot.pairs()? {
                    self.sizes[ctx.resident(father)?] += size;
                }
            }
            Phase::Gather => {
                slot.expect(SlotKind::Candidates)?;
                match ctx.parent() {
                    Some(parent) => ctx.endpoint.post(parent, slot.relabeled(MORE)),
                    None => self.gathered.extend(slot.candidates()?),
                }
            }
            Phase::Broadcast => {
                for child in ctx.children() {
                    ctx.endpoint.post(child, slot.raw().clone());
                }
                if slot.kind == SlotKind::Verdict {
                    self.apply_verdict(slot.verdict()?);
                } else {
                    slot.expect(SlotKind::Offsets)?;
                    for (id, offset) in slot.pairs()? {
                        if let Some(elem) = ctx.mesh.local_index(id) {
                            self.positions[elem] = offset;
                        }
                    }
                }
            }
            Phase::SonRecords(_) => {
                slot.expect(SlotKind::SonRecords)?;
                for SonRecord { father, record } in slot.son_records()? {
                    let father = ctx.resident(father)?;
                    let remote = self
                        .remote_fathers
                        .get_mut(&father)
                        .ok_or(SlotError::UnknownElement(record.candidate.id))?;
                    remote.table.insert(record, slot.origin)?;
                }
            }
            Phase::SonPositions(_) => {
                slot.expect(SlotKind::SonPositions)?;
                for (son, position) in slot.pairs()? {
                    self.positions[ctx.resident(son)?] = position;
                }
            }
            Phase::OutcomeUp => {
                slot.expect(SlotKind::Verdict)?;
                if let Verdict::OutOfMemory(oom) = slot.verdict()? {
                    self.outcome.get_or_insert(oom);
                }
            }
            Phase::OutcomeDown => {
                slot.expect(SlotKind::Verdict)?;
                self.outcome = match slot.verdict()? {
                    Verdict::OutOfMemory(oom) => Some(oom),
                    _ => None,
                };
            }
            Phase::Start | Phase::Done => (),
        }
        Ok(())
    }

    // the current phase is complete on this rank; start the next one
    fn advance<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        match self.phase {
            Phase::Start => {
                self.top = ctx.mesh.max_level();
                self.phase = Phase::CensusUp;
                self.open = ctx.children();
            }
            Phase::CensusUp => match ctx.parent() {
                Some(parent) => {
                    let census = slot::census(ctx.rank(), self.top, ctx.config.slot_size);
                    ctx.endpoint.post(parent, census);
                    self.phase = Phase::CensusDown;
                    self.open = vec![parent];
                }
                None => self.after_census(ctx)?,
            },
            Phase::CensusDown => self.after_census(ctx)?,
            Phase::Sizes(level) => {
                accumulate_level(ctx.mesh, level - 1, &mut self.sizes);
                if level > 1 {
                    self.enter_sizes(level - 1, ctx)?;
                } else {
                    self.enter_gather(ctx);
                }
            }
            Phase::Gather => match ctx.parent() {
                Some(parent) => {
                    let mesh = ctx.mesh;
                    let mut writer = SlotWriter::new(
                        SlotKind::Candidates,
                        ctx.rank(),
                        0,
                        ctx.config.slot_size,
                    );
                    for elem in mesh.elements_on_level(0) {
                        writer.candidate(&self.record(mesh, elem))?;
                    }
                    ctx.endpoint.post_all(parent, writer.finish());
                    self.phase = Phase::Broadcast;
                    self.open = vec![parent];
                }
                None => {
                    self.coordinate(ctx)?;
                    self.enter_sons(0, ctx)?;
                }
            },
            Phase::Broadcast => self.enter_sons(0, ctx)?,
            Phase::SonRecords(level) => self.resolve_remote_sons(level, ctx)?,
            Phase::SonPositions(level) => self.enter_sons(level + 1, ctx)?,
            Phase::OutcomeUp => match ctx.parent() {
                Some(parent) => {
                    let outcome = self.outcome_slot(ctx);
                    ctx.endpoint.post(parent, outcome);
                    self.phase = Phase::OutcomeDown;
                    self.open = vec![parent];
                }
                None => self.after_outcome(ctx),
            },
            Phase::OutcomeDown => self.after_outcome(ctx),
            Phase::Done => (),
        }
        Ok(())
    }

    fn after_census<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        let census = slot::census(ctx.rank(), self.top, ctx.config.slot_size);
        for child in ctx.children() {
            ctx.endpoint.post(child, census.clone());
        }
        log::debug!("rank {}: finest level {}", ctx.rank(), self.top);

        if self.top > 0 {
            self.enter_sizes(self.top, ctx)
        } else {
            self.enter_gather(ctx);
            Ok(())
        }
    }

    fn enter_sizes<M: MeshAccess>(&mut self, level: u8, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        let mesh = ctx.mesh;
        let mut writers = ctx.writers(SlotKind::Sizes, level as u32);
        for elem in mesh.elements_on_level(level) {
            if let Some(father) = mesh.father(elem) {
                if mesh.local_index(father).is_none() {
                    writers[ctx.owner(father)?].pair(father, self.sizes[elem])?;
                }
            }
        }
        ctx.post_streams(writers);
        self.phase = Phase::Sizes(level);
        self.open = ctx.peers();
        Ok(())
    }

    fn enter_gather<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) {
        let mesh = ctx.mesh;
        if ctx.parent().is_none() {
            self.gathered = mesh
                .elements_on_level(0)
                .into_iter()
                .map(|elem| self.record(mesh, elem))
                .collect();
        }
        self.phase = Phase::Gather;
        self.open = ctx.children();
    }

    fn enumerating(&self) -> bool {
        self.failure.is_some()
    }

    fn record<M: MeshAccess>(&self, mesh: &M, elem: usize) -> CandidateRecord {
        let candidate = match &self.transform {
            Some(transform) if !self.enumerating() => {
                OcclusionCandidate::from_element(mesh, elem, transform, self.faces[elem])
            }
            _ => OcclusionCandidate {
                id: mesh.global_id(elem),
                bbox: ScreenBox::empty(),
                depth_min: 0.0,
                depth_max: 0.0,
                faces: SmallVec::new(),
            },
        };
        CandidateRecord {
            candidate,
            size: self.sizes[elem],
        }
    }

    fn apply_verdict(&mut self, verdict: Verdict) {
        let failure = match verdict {
            Verdict::Ordered | Verdict::Skipped => return,
            Verdict::NoFirstShell => OrderError::NoFirstShell,
            Verdict::UntractableCycle => OrderError::UntractableCycle,
            Verdict::OutOfMemory(oom) => OrderError::OutOfMemory(oom),
        };
        self.failure.get_or_insert(failure);
    }

    // coordinator: order the gathered coarse grid and broadcast the plot offsets
    fn coordinate<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        let mut records = std::mem::take(&mut self.gathered);
        records.sort_by_key(|r| r.candidate.id);
        let (candidates, sizes): (Vec<OcclusionCandidate>, Vec<u32>) =
            records.into_iter().map(|r| (r.candidate, r.size)).unzip();
        self.stats.coarse_elements = candidates.len();

        let (verdict, order): (Verdict, Vec<u32>) = if self.enumerating() {
            (Verdict::Skipped, (0..candidates.len() as u32).collect())
        } else {
            let mark = self.arena.mark();
            let eps = ctx.config.depth_epsilon;
            let result = build_graph(&candidates, PairSearch::Indexed, eps, &mut self.arena)
                .map_err(ShellError::from)
                .and_then(|graph| {
                    let order = peel(&graph, ctx.config.coarse_cycle_bound, &mut self.arena)?;
                    Ok((order, graph.num_edges()))
                });
            self.arena.release(mark);

            match result {
                Ok((order, edges)) => {
                    log::debug!(
                        "coordinator: {} coarse Elements, {} edges, {} shells, {} cycle breaks",
                        candidates.len(),
                        edges,
                        order.shells,
                        order.cycle_breaks
                    );
                    self.stats.edges = edges;
                    self.stats.shells = order.shells;
                    self.stats.cycle_breaks = order.cycle_breaks;
                    (Verdict::Ordered, order.draw_order().collect())
                }
                Err(err) => {
                    let verdict = match err {
                        ShellError::NoFirstShell => Verdict::NoFirstShell,
                        ShellError::UntractableCycle { .. } => Verdict::UntractableCycle,
                        ShellError::OutOfMemory(oom) => Verdict::OutOfMemory(oom),
                    };
                    self.failure = Some(err.into());
                    (verdict, (0..candidates.len() as u32).collect())
                }
            }
        };

        let mut writer = SlotWriter::new(SlotKind::Offsets, ctx.rank(), 0, ctx.config.slot_size);
        let mut next = 0;
        for c in order {
            let id = candidates[c as usize].id;
            writer.pair(id, next)?;
            if let Some(elem) = ctx.mesh.local_index(id) {
                self.positions[elem] = next;
            }
            next += sizes[c as usize];
        }
        let offsets = writer.finish();
        let verdict = slot::verdict(ctx.rank(), verdict, MORE, ctx.config.slot_size);

        for child in ctx.children() {
            ctx.endpoint.post(child, verdict.clone());
            ctx.endpoint.post_all(child, offsets.iter().cloned());
        }
        Ok(())
    }

    // order the sons of resident fathers on `level`; sons with a remote father go to its owner
    fn enter_sons<M: MeshAccess>(&mut self, level: u8, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        let mesh = ctx.mesh;
        self.remote_fathers.clear();
        self.arena.release(0);
        if level >= self.top {
            self.enter_outcome(ctx);
            return Ok(());
        }

        for father in mesh.elements_on_level(level) {
            let sons = mesh.sons(father);
            if sons.is_empty() {
                continue;
            }
            self.stats.fathers += 1;

            if sons.iter().all(|son| mesh.local_index(*son).is_some()) {
                self.order_resident_sons(father, ctx);
                continue;
            }

            let (table, peelable) = match SonTable::with_sons(sons, &mut self.arena) {
                Ok(table) => (table, true),
                Err(oom) => {
                    self.son_oom.get_or_insert(oom);
                    (SonTable::with_sons(sons, &mut PassArena::new(usize::MAX))?, false)
                }
            };
            let mut remote = RemoteFather { table, peelable };
            for son in sons.iter().filter_map(|son| mesh.local_index(*son)) {
                remote.table.insert(self.record(mesh, son), ctx.rank())?;
            }
            self.remote_fathers.insert(father, remote);
        }

        let mut writers = ctx.writers(SlotKind::SonRecords, level as u32);
        for son in mesh.elements_on_level(level + 1) {
            if let Some(father) = mesh.father(son) {
                if mesh.local_index(father).is_none() {
                    let record = SonRecord {
                        father,
                        record: self.record(mesh, son),
                    };
                    writers[ctx.owner(father)?].son_record(&record)?;
                }
            }
        }
        ctx.post_streams(writers);
        self.phase = Phase::SonRecords(level);
        self.open = ctx.peers();
        Ok(())
    }

    // a failed pass is already in enumeration order on every rank; otherwise every rank learns
    // whether any rank ran out of memory while ordering sons
    fn enter_outcome<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) {
        if self.settled || self.enumerating() {
            self.phase = Phase::Done;
            self.open.clear();
            return;
        }
        self.settled = true;
        self.outcome = self.son_oom;
        self.phase = Phase::OutcomeUp;
        self.open = ctx.children();
    }

    fn outcome_slot<M: MeshAccess>(&self, ctx: &RankContext<M>) -> Bytes {
        let verdict = match self.outcome {
            Some(oom) => Verdict::OutOfMemory(oom),
            None => Verdict::Ordered,
        };
        slot::verdict(ctx.rank(), verdict, LAST, ctx.config.slot_size)
    }

    // the outcome is final: done, or redo the plot positions in enumeration order on every rank
    fn after_outcome<M: MeshAccess>(&mut self, ctx: &mut RankContext<M>) {
        let outcome = self.outcome_slot(ctx);
        for child in ctx.children() {
            ctx.endpoint.post(child, outcome.clone());
        }

        match self.outcome {
            None => {
                self.phase = Phase::Done;
                self.open.clear();
            }
            Some(oom) => {
                log::debug!(
                    "rank {}: son ordering ran out of memory on some rank; enumerating",
                    ctx.rank()
                );
                self.failure = Some(OrderError::OutOfMemory(oom));
                self.stats = PassStats::default();
                self.enter_gather(ctx);
            }
        }
    }

    fn order_resident_sons<M: MeshAccess>(&mut self, father: usize, ctx: &RankContext<M>) {
        let mesh = ctx.mesh;
        let enumeration = || -> Vec<usize> {
            mesh.sons(father)
                .iter()
                .filter_map(|son| mesh.local_index(*son))
                .collect()
        };

        let sons = match &self.transform {
            Some(transform) if !self.enumerating() && self.son_oom.is_none() => {
                match order_sons(mesh, father, transform, &self.faces, ctx.config, &mut self.arena) {
                    Ok((sons, ordered)) => {
                        if !ordered {
                            self.stats.son_fallbacks += 1;
                        }
                        sons
                    }
                    Err(oom) => {
                        self.son_oom = Some(oom);
                        enumeration()
                    }
                }
            }
            _ => enumeration(),
        };
        place_block(
            self.positions[father],
            sons.iter().map(|son| (*son, self.sizes[*son])),
            &mut self.positions,
        );
    }

    // every son record has arrived: order each remote father's sons and return their positions
    fn resolve_remote_sons<M: MeshAccess>(&mut self, level: u8, ctx: &mut RankContext<M>) -> Result<(), OrderError> {
        let mesh = ctx.mesh;
        let mut writers = ctx.writers(SlotKind::SonPositions, level as u32);

        for (father, remote) in std::mem::take(&mut self.remote_fathers) {
            let RemoteFather {
                mut table,
                peelable,
            } = remote;
            if let Some(missing) = table.missing() {
                return Err(SlotError::MissingSon(missing).into());
            }

            let enumeration: Vec<u32> = (0..table.len() as u32).collect();
            let order = if peelable && !self.enumerating() && self.son_oom.is_none() {
                self.peel_sons(&mut table, ctx.config).unwrap_or(enumeration)
            } else {
                enumeration
            };

            let mut next = self.positions[father] + 1;
            for entry in order {
                let id = table.id(entry);
                match mesh.local_index(id) {
                    Some(son) => self.positions[son] = next,
                    None => writers[table.owner(entry)].pair(id, next)?,
                }
                next += table.size(entry).ok_or(SlotError::MissingSon(id))?;
            }
        }

        ctx.post_streams(writers);
        self.phase = Phase::SonPositions(level);
        self.open = ctx.peers();
        Ok(())
    }

    fn peel_sons(&mut self, table: &mut SonTable, config: &OrderingConfig) -> Option<Vec<u32>> {
        let mark = self.arena.mark();
        let result = table
            .link(config.depth_epsilon, &mut self.arena)
            .map_err(ShellError::from)
            .and_then(|_| peel(&*table, config.son_cycle_bound, &mut self.arena));
        self.arena.release(mark);
        match result {
            Ok(order) => Some(order.draw_order().collect()),
            Err(ShellError::OutOfMemory(oom)) => {
                self.son_oom = Some(oom);
                None
            }
            Err(err) => {
                log::warn!(
                    "unable to order {} sons ({}); using enumeration order",
                    table.len(),
                    err
                );
                self.stats.son_fallbacks += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanning_tree() {
        assert_eq!(tree_parent(0, 4), None);
        assert_eq!(tree_parent(4, 4), Some(0));
        assert_eq!(tree_parent(5, 4), Some(1));
        assert_eq!(tree_parent(8, 2), Some(3));
        assert_eq!(tree_children(0, 4, 10).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(tree_children(1, 4, 7).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(tree_children(3, 2, 7).count(), 0);

        // every rank but the root is the child of its parent
        for b in 1..=8 {
            for rank in 1..40 {
                let parent = tree_parent(rank, b).unwrap();
                assert!(tree_children(parent, b, 40).any(|c| c == rank));
            }
        }
    }
}
