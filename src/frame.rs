pub mod cycle;
pub mod synchronizer;

pub use cycle::{FrameContext, FrameCycle, FrameReport, PresentOutcome};
pub use synchronizer::{AcquiredImage, FrameSynchronizer, SlotState};

/// Index of one in-flight frame slot. Every per-frame resource copy is addressed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Which frame slot is being recorded right now.
///
/// Starts at 0 and only moves forward by one (wrapping at `frame_count`) once a
/// frame has been presented.
#[derive(Debug, Clone)]
pub struct FrameCursor {
    current: usize,
    frame_count: usize,
}

impl FrameCursor {
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > 0, "At least one frame in flight is required");
        Self {
            current: 0,
            frame_count,
        }
    }

    pub fn current(&self) -> FrameIndex {
        FrameIndex(self.current)
    }

    pub fn next(&self) -> FrameIndex {
        FrameIndex((self.current + 1) % self.frame_count)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub(crate) fn advance(&mut self) -> FrameIndex {
        self.current = (self.current + 1) % self.frame_count;
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_wraps_around() {
        let mut cursor = FrameCursor::new(3);
        assert_eq!(cursor.current(), FrameIndex::new(0));
        assert_eq!(cursor.next(), FrameIndex::new(1));

        let visited: Vec<_> = (0..7).map(|_| cursor.advance().index()).collect();
        assert_eq!(visited, vec![1, 2, 0, 1, 2, 0, 1]);
        assert_eq!(cursor.next(), FrameIndex::new(2));
    }

    #[test]
    #[should_panic]
    fn zero_frames_in_flight_is_rejected() {
        FrameCursor::new(0);
    }
}
