//! Time markers for placing segments on an audio timeline.

use alloc::vec::Vec;
use core::cmp::Ordering;

/// Position of a segment in time.
///
/// A timestamp is either a wall-clock marker or an offset counted in
/// frames. The two modes are mutually exclusive and never compare with
/// each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timestamp {
    /// Seconds and nanoseconds since the Unix epoch.
    Unix { sec: u64, nsec: u32 },
    /// Frames from the start of the session.
    Offset(u64),
}

impl Timestamp {
    /// Create a wall-clock timestamp.
    pub const fn unix(sec: u64, nsec: u32) -> Self {
        Timestamp::Unix { sec, nsec }
    }

    /// Create an offset timestamp.
    pub const fn offset(frames: u64) -> Self {
        Timestamp::Offset(frames)
    }

    /// Offset timestamp of the first frame of `tick`.
    pub const fn from_tick(tick: u64, buffer_size: u32) -> Self {
        Timestamp::Offset(tick * buffer_size as u64)
    }

    /// Current wall-clock time.
    #[cfg(feature = "std")]
    pub fn now() -> Self {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::Unix {
            sec: elapsed.as_secs(),
            nsec: elapsed.subsec_nanos(),
        }
    }

    /// Whether this is an offset-counter marker.
    pub fn is_offset(&self) -> bool {
        matches!(self, Timestamp::Offset(_))
    }

    /// Frame offset, if this is an offset marker.
    pub fn frames(&self) -> Option<u64> {
        match self {
            Timestamp::Offset(frames) => Some(*frames),
            Timestamp::Unix { .. } => None,
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Timestamp::Offset(a), Timestamp::Offset(b)) => Some(a.cmp(b)),
            (Timestamp::Unix { sec: a, nsec: an }, Timestamp::Unix { sec: b, nsec: bn }) => {
                Some((a, an).cmp(&(b, bn)))
            }
            _ => None,
        }
    }
}

/// Sorted list of timestamps belonging to one audio's segments.
///
/// Insertion keeps the list ordered; markers of the other mode than the
/// first one inserted are rejected.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    markers: Vec<Timestamp>,
}

impl Timeline {
    pub fn new() -> Self {
        Self { markers: Vec::new() }
    }

    /// Insert a marker, returning its index, or `None` if its mode does
    /// not match the markers already present.
    pub fn insert(&mut self, timestamp: Timestamp) -> Option<usize> {
        if let Some(first) = self.markers.first() {
            if first.is_offset() != timestamp.is_offset() {
                return None;
            }
        }
        let pos = self
            .markers
            .partition_point(|t| t.partial_cmp(&timestamp) != Some(Ordering::Greater));
        self.markers.insert(pos, timestamp);
        Some(pos)
    }

    pub fn first(&self) -> Option<&Timestamp> {
        self.markers.first()
    }

    pub fn last(&self) -> Option<&Timestamp> {
        self.markers.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Timestamp> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_ordering() {
        let t1 = Timestamp::offset(10);
        let t2 = Timestamp::offset(20);
        assert!(t1 < t2);
        assert_eq!(Timestamp::from_tick(3, 512), Timestamp::offset(1536));
    }

    #[test]
    fn modes_do_not_compare() {
        let a = Timestamp::offset(10);
        let b = Timestamp::unix(10, 0);
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(b.frames(), None);
    }

    #[test]
    fn unix_ordering_uses_nanoseconds() {
        assert!(Timestamp::unix(5, 100) < Timestamp::unix(5, 200));
        assert!(Timestamp::unix(4, 999) < Timestamp::unix(5, 0));
    }

    #[test]
    fn timeline_stays_sorted() {
        let mut timeline = Timeline::new();
        timeline.insert(Timestamp::offset(300));
        timeline.insert(Timestamp::offset(100));
        timeline.insert(Timestamp::offset(200));
        let frames: Vec<u64> = timeline.iter().filter_map(|t| t.frames()).collect();
        assert_eq!(frames, alloc::vec![100, 200, 300]);
    }

    #[test]
    fn timeline_rejects_mixed_modes() {
        let mut timeline = Timeline::new();
        assert_eq!(timeline.insert(Timestamp::offset(1)), Some(0));
        assert_eq!(timeline.insert(Timestamp::unix(1, 0)), None);
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn equal_markers_insert_after_existing() {
        let mut timeline = Timeline::new();
        timeline.insert(Timestamp::offset(5));
        assert_eq!(timeline.insert(Timestamp::offset(5)), Some(1));
    }
}
