// Segment index: an ordered run of segment references with stable,
// monotonically increasing positions that survive live-window eviction.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::SegmentReference;
use crate::GAP_OVERLAP_TOLERANCE;

/// An ordered list of [`SegmentReference`]s for one stream.
///
/// Positions are global: they keep increasing across live merges, and
/// evicted references leave a position gap at the front, never renumber.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    references: Vec<SegmentReference>,
}

impl SegmentIndex {
    pub fn new(references: Vec<SegmentReference>) -> Self {
        debug_assert!(
            references
                .windows(2)
                .all(|w| w[0].position + 1 == w[1].position
                    && w[1].start_time >= w[0].end_time - GAP_OVERLAP_TOLERANCE),
            "segment references must be contiguous and time-ordered"
        );
        Self { references }
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn first_position(&self) -> Option<u64> {
        self.references.first().map(|r| r.position)
    }

    pub fn last_position(&self) -> Option<u64> {
        self.references.last().map(|r| r.position)
    }

    /// Finds the position of the segment containing `time` (period-relative
    /// seconds). A time falling in a small gap between segments resolves to
    /// the following segment; a time before the first segment resolves to
    /// the first segment.
    pub fn find(&self, time: f64) -> Option<u64> {
        let first = self.references.first()?;
        if time < first.start_time {
            return Some(first.position);
        }
        for reference in &self.references {
            if time >= reference.start_time && time < reference.end_time {
                return Some(reference.position);
            }
            if time < reference.start_time {
                // Gap: resolve to the segment after it.
                return Some(reference.position);
            }
        }
        None
    }

    pub fn get(&self, position: u64) -> Option<&SegmentReference> {
        let first = self.first_position()?;
        let offset = position.checked_sub(first)? as usize;
        self.references.get(offset)
    }

    /// Replaces the overlapping tail of this index with `new_references`
    /// (from a manifest update) and appends the rest. References strictly
    /// before the update window are kept untouched.
    pub fn merge(&mut self, new_references: Vec<SegmentReference>) {
        let Some(first_new) = new_references.first() else {
            return;
        };
        let keep = self
            .references
            .iter()
            .take_while(|r| r.position < first_new.position)
            .count();
        let dropped = self.references.len() - keep;
        if dropped > 0 {
            debug!(dropped, "Replacing segment references from manifest update");
        }
        self.references.truncate(keep);
        self.references.extend(new_references);
    }

    /// Drops references that end before `availability_start`.
    pub fn evict(&mut self, availability_start: f64) {
        let keep_from = self
            .references
            .iter()
            .position(|r| r.end_time > availability_start)
            .unwrap_or(self.references.len());
        if keep_from > 0 {
            self.references.drain(..keep_from);
        }
    }

    /// Clamps the index to `period_duration`: drops references wholly past
    /// the period end and truncates the end time of a straddling last
    /// reference.
    pub fn fit(&mut self, period_duration: f64) {
        if !period_duration.is_finite() {
            return;
        }
        self.references
            .retain(|r| r.start_time < period_duration - f64::EPSILON);
        if let Some(last) = self.references.last_mut() {
            if last.end_time > period_duration {
                last.end_time = period_duration;
            }
        }
    }

    pub fn references(&self) -> &[SegmentReference] {
        &self.references
    }
}

/// Shared, lazily created segment index.
///
/// The manifest parser populates the handle when `create_segment_index`
/// resolves; the streaming engine only ever reads through it. Holding the
/// handle (not the stream) lets the engine survive manifest updates that
/// rebuild the period tree.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndexHandle {
    inner: Arc<RwLock<Option<SegmentIndex>>>,
}

impl SegmentIndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle that is already populated.
    pub fn with_index(index: SegmentIndex) -> Self {
        let handle = Self::new();
        handle.set(index);
        handle
    }

    pub fn is_created(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn set(&self, index: SegmentIndex) {
        *self.inner.write() = Some(index);
    }

    /// Runs `f` against the index, if created.
    pub fn with<R>(&self, f: impl FnOnce(&SegmentIndex) -> R) -> Option<R> {
        self.inner.read().as_ref().map(f)
    }

    /// Runs `f` against the mutable index, if created.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut SegmentIndex) -> R) -> Option<R> {
        self.inner.write().as_mut().map(f)
    }

    pub fn find(&self, time: f64) -> Option<u64> {
        self.with(|index| index.find(time)).flatten()
    }

    /// Clones the reference at `position`.
    pub fn get(&self, position: u64) -> Option<SegmentReference> {
        self.with(|index| index.get(position).cloned()).flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentReference;

    fn refs(first_position: u64, start: f64, count: usize, duration: f64) -> Vec<SegmentReference> {
        (0..count)
            .map(|i| {
                SegmentReference::with_uris(
                    first_position + i as u64,
                    start + i as f64 * duration,
                    start + (i + 1) as f64 * duration,
                    vec![format!("seg{}.m4s", first_position + i as u64)],
                    None,
                    None,
                )
            })
            .collect()
    }

    #[test]
    fn find_resolves_containing_segment() {
        let index = SegmentIndex::new(refs(0, 0.0, 4, 10.0));
        assert_eq!(index.find(0.0), Some(0));
        assert_eq!(index.find(9.999), Some(0));
        assert_eq!(index.find(10.0), Some(1));
        assert_eq!(index.find(35.0), Some(3));
        assert_eq!(index.find(40.0), None);
    }

    #[test]
    fn find_before_first_segment_resolves_to_first() {
        let index = SegmentIndex::new(refs(5, 2.0, 2, 10.0));
        assert_eq!(index.find(0.0), Some(5));
    }

    #[test]
    fn get_respects_global_positions() {
        let index = SegmentIndex::new(refs(7, 0.0, 3, 4.0));
        assert_eq!(index.get(7).unwrap().start_time, 0.0);
        assert_eq!(index.get(9).unwrap().start_time, 8.0);
        assert!(index.get(6).is_none());
        assert!(index.get(10).is_none());
    }

    #[test]
    fn merge_replaces_overlapping_tail() {
        let mut index = SegmentIndex::new(refs(0, 0.0, 4, 10.0));
        // Update re-describes positions 2.. with different timing.
        index.merge(refs(2, 20.0, 3, 5.0));
        assert_eq!(index.len(), 5);
        assert_eq!(index.first_position(), Some(0));
        assert_eq!(index.last_position(), Some(4));
        assert_eq!(index.get(2).unwrap().end_time, 25.0);
    }

    #[test]
    fn evict_drops_unavailable_references_and_keeps_positions() {
        let mut index = SegmentIndex::new(refs(0, 0.0, 5, 10.0));
        index.evict(25.0);
        assert_eq!(index.first_position(), Some(2));
        // Positions remain stable after eviction.
        assert_eq!(index.get(2).unwrap().start_time, 20.0);
        assert!(index.get(1).is_none());
    }

    #[test]
    fn fit_truncates_to_period_duration() {
        let mut index = SegmentIndex::new(refs(0, 0.0, 5, 10.0));
        index.fit(35.0);
        assert_eq!(index.len(), 4);
        assert_eq!(index.get(3).unwrap().end_time, 35.0);
    }

    #[test]
    fn handle_is_usable_after_creation_only() {
        let handle = SegmentIndexHandle::new();
        assert!(!handle.is_created());
        assert_eq!(handle.find(0.0), None);
        handle.set(SegmentIndex::new(refs(0, 0.0, 2, 10.0)));
        assert!(handle.is_created());
        assert_eq!(handle.find(15.0), Some(1));
        assert_eq!(handle.get(1).unwrap().start_time, 10.0);
    }

    #[test]
    fn positions_are_monotone_along_presentation_time() {
        let index = SegmentIndex::new(refs(3, 0.0, 6, 2.0));
        let mut last = None;
        for r in index.references() {
            if let Some(prev) = last {
                assert!(r.start_time >= prev);
            }
            last = Some(r.start_time);
        }
    }
}
