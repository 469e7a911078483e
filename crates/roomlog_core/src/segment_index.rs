//! Segment order index.
//!
//! Segments are kept in an arena keyed by id, each with explicit
//! previous/next ids. An island is a maximal chain of linked segments; within
//! an island every segment has a rank equal to its position in the chain.
//! Segments on different islands have no known relative order.
//!
//! Any structural change triggers a full rebuild of the islands. Rooms hold
//! few segments even when they hold many events, so the rebuild stays cheap.

use crate::error::{CoreError, CoreResult};
use roomlog_store::{SegmentId, SegmentRecord};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentLinks {
    previous_id: Option<SegmentId>,
    next_id: Option<SegmentId>,
}

impl From<&SegmentRecord> for SegmentLinks {
    fn from(segment: &SegmentRecord) -> Self {
        Self {
            previous_id: segment.previous_id,
            next_id: segment.next_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    island: usize,
    rank: usize,
}

/// Tracks which segments are mutually ordered and in what order.
#[derive(Debug, Clone)]
pub struct SegmentOrderIndex {
    room_id: String,
    segments: BTreeMap<SegmentId, SegmentLinks>,
    placements: HashMap<SegmentId, Placement>,
    islands: Vec<Vec<SegmentId>>,
}

impl SegmentOrderIndex {
    /// Creates an empty index for a room.
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            segments: BTreeMap::new(),
            placements: HashMap::new(),
            islands: Vec::new(),
        }
    }

    /// Creates an index from every segment of a room.
    pub fn from_segments(
        room_id: impl Into<String>,
        segments: &[SegmentRecord],
    ) -> CoreResult<Self> {
        let mut index = Self::new(room_id);
        index.rebuild(segments)?;
        Ok(index)
    }

    /// Replaces the index contents with `segments` and recomputes the islands.
    ///
    /// On failure the index is left unchanged.
    pub fn rebuild(&mut self, segments: &[SegmentRecord]) -> CoreResult<()> {
        let arena: BTreeMap<SegmentId, SegmentLinks> =
            segments.iter().map(|s| (s.id, SegmentLinks::from(s))).collect();
        self.install(arena)
    }

    /// Adds or updates one segment and recomputes the islands.
    pub fn add(&mut self, segment: &SegmentRecord) -> CoreResult<()> {
        self.apply(std::slice::from_ref(segment))
    }

    /// Adds or updates several segments with a single rebuild.
    pub fn apply(&mut self, segments: &[SegmentRecord]) -> CoreResult<()> {
        if segments.is_empty() {
            return Ok(());
        }
        let mut arena = self.segments.clone();
        for segment in segments {
            arena.insert(segment.id, SegmentLinks::from(segment));
        }
        self.install(arena)
    }

    fn install(&mut self, arena: BTreeMap<SegmentId, SegmentLinks>) -> CoreResult<()> {
        let islands = build_islands(&self.room_id, &arena)?;
        let mut placements = HashMap::with_capacity(arena.len());
        for (island, chain) in islands.iter().enumerate() {
            for (rank, id) in chain.iter().enumerate() {
                placements.insert(*id, Placement { island, rank });
            }
        }
        self.segments = arena;
        self.placements = placements;
        self.islands = islands;
        Ok(())
    }

    /// Compares two segments.
    ///
    /// Fails if either is unknown or if they sit on different islands.
    pub fn compare(&self, a: SegmentId, b: SegmentId) -> CoreResult<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let pa = self.placement(a)?;
        let pb = self.placement(b)?;
        if pa.island != pb.island {
            return Err(CoreError::UnrelatedSegments { a, b });
        }
        Ok(pa.rank.cmp(&pb.rank))
    }

    fn placement(&self, id: SegmentId) -> CoreResult<Placement> {
        self.placements
            .get(&id)
            .copied()
            .ok_or(CoreError::UnknownSegment { segment_id: id })
    }

    /// Returns true if the segment is known.
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.placements.contains_key(&id)
    }

    /// Returns true if both segments are known and mutually ordered.
    #[must_use]
    pub fn are_comparable(&self, a: SegmentId, b: SegmentId) -> bool {
        self.compare(a, b).is_ok()
    }

    /// Returns the islands, each as its ordered chain of segment ids.
    #[must_use]
    pub fn islands(&self) -> &[Vec<SegmentId>] {
        &self.islands
    }

    /// Returns the number of known segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if no segment is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Partitions the arena into islands by walking previous and next pointers.
fn build_islands(
    room_id: &str,
    arena: &BTreeMap<SegmentId, SegmentLinks>,
) -> CoreResult<Vec<Vec<SegmentId>>> {
    let mut unvisited: BTreeSet<SegmentId> = arena.keys().copied().collect();
    let mut islands = Vec::new();

    while let Some(start) = unvisited.pop_first() {
        let mut chain = VecDeque::from([start]);

        let mut current = start;
        while let Some(previous) = arena[&current].previous_id {
            let links = arena.get(&previous).ok_or_else(|| {
                CoreError::broken_link(
                    room_id,
                    format!("segment {current} points back to unknown segment {previous}"),
                )
            })?;
            if links.next_id != Some(current) {
                return Err(CoreError::broken_link(
                    room_id,
                    format!(
                        "segment {current} has previous {previous}, but {previous} has next {:?}",
                        links.next_id
                    ),
                ));
            }
            if !unvisited.remove(&previous) {
                return Err(CoreError::broken_link(
                    room_id,
                    format!("segment {previous} reached twice while walking back from {start}"),
                ));
            }
            chain.push_front(previous);
            current = previous;
        }

        let mut current = start;
        while let Some(next) = arena[&current].next_id {
            let links = arena.get(&next).ok_or_else(|| {
                CoreError::broken_link(
                    room_id,
                    format!("segment {current} points forward to unknown segment {next}"),
                )
            })?;
            if links.previous_id != Some(current) {
                return Err(CoreError::broken_link(
                    room_id,
                    format!(
                        "segment {current} has next {next}, but {next} has previous {:?}",
                        links.previous_id
                    ),
                ));
            }
            if !unvisited.remove(&next) {
                return Err(CoreError::broken_link(
                    room_id,
                    format!("segment {next} reached twice while walking forward from {start}"),
                ));
            }
            chain.push_back(next);
            current = next;
        }

        islands.push(chain.into());
    }

    Ok(islands)
}
