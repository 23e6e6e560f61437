use crate::geometry::ScreenBox;

/// A node of the [`SpatialIndex`], holding the median candidate of its subtree
#[derive(Clone, Debug)]
struct IndexNode {
    candidate: u32,
    /// Axis the subtree was split on (0 = u, 1 = v)
    axis: u8,
    /// Union of all boxes in the subtree
    extent: ScreenBox,
    /// Smallest candidate index in the subtree
    min_candidate: u32,
    left: Option<u32>,
    right: Option<u32>,
}

/// Balanced 2D box tree over the screen-space bounding boxes of occlusion candidates
///
/// Built once per ordering pass by recursive median partitioning, alternating between the u and v
/// axes level by level. Each node stores the extents of its whole subtree for pruning.
#[derive(Clone, Debug)]
pub struct SpatialIndex {
    boxes: Vec<ScreenBox>,
    nodes: Vec<IndexNode>,
    root: Option<u32>,
}

impl SpatialIndex {
    /// Index every box
    pub fn build(boxes: &[ScreenBox]) -> Self {
        Self::build_subset(boxes, (0..boxes.len() as u32).collect())
    }

    /// Index only the boxes listed in `members` (indices into `boxes`)
    pub fn build_subset(boxes: &[ScreenBox], mut members: Vec<u32>) -> Self {
        let mut index = Self {
            boxes: boxes.to_vec(),
            nodes: Vec::with_capacity(members.len()),
            root: None,
        };
        index.root = index.build_node(&mut members, 0);
        index
    }

    fn build_node(&mut self, items: &mut [u32], depth: usize) -> Option<u32> {
        if items.is_empty() {
            return None;
        }

        let axis = depth % 2;
        let mid = items.len() / 2;
        {
            let boxes = &self.boxes;
            items.select_nth_unstable_by(mid, |a, b| {
                boxes[*a as usize]
                    .min(axis)
                    .total_cmp(&boxes[*b as usize].min(axis))
                    .then(a.cmp(b))
            });
        }

        let candidate = items[mid];
        let (lower, rest) = items.split_at_mut(mid);
        let left = self.build_node(lower, depth + 1);
        let right = self.build_node(&mut rest[1..], depth + 1);

        let mut extent = self.boxes[candidate as usize];
        let mut min_candidate = candidate;
        for child in left.iter().chain(right.iter()) {
            let child = &self.nodes[*child as usize];
            extent = extent.merged(&child.extent);
            min_candidate = min_candidate.min(child.min_candidate);
        }

        self.nodes.push(IndexNode {
            candidate,
            axis: axis as u8,
            extent,
            min_candidate,
            left,
            right,
        });
        Some(self.nodes.len() as u32 - 1)
    }

    /// Number of indexed candidates
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Indexed candidates whose boxes overlap the box of candidate `i` and whose index is below `i`
    pub fn query(&self, i: u32) -> Vec<u32> {
        let mut hits = Vec::new();
        if let Some(query) = self.boxes.get(i as usize) {
            self.query_box(query, i, &mut hits);
        }
        hits
    }

    /// Collect indexed candidates whose boxes overlap `query` and whose index is below `below`
    pub fn query_box(&self, query: &ScreenBox, below: u32, hits: &mut Vec<u32>) {
        if let Some(root) = self.root {
            self.query_node(root, query, below, hits);
        }
    }

    fn query_node(&self, node_idx: u32, query: &ScreenBox, below: u32, hits: &mut Vec<u32>) {
        let node = &self.nodes[node_idx as usize];
        if node.min_candidate >= below || !node.extent.overlaps(query) {
            return;
        }

        if node.candidate < below && self.boxes[node.candidate as usize].overlaps(query) {
            hits.push(node.candidate);
        }

        if let Some(left) = node.left {
            self.query_node(left, query, below, hits);
        }
        // every box in the right subtree starts at or after the median on the split axis
        let axis = node.axis as usize;
        if query.max(axis) >= self.boxes[node.candidate as usize].min(axis) {
            if let Some(right) = node.right {
                self.query_node(right, query, below, hits);
            }
        }
    }
}
