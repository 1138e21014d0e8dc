use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::RenderResult,
    frame::{FrameCursor, FrameIndex},
};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(0);

/// Identifies a GPU resource that exists once per frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A write that has to end up in every per-frame copy of a resource.
pub trait FrameWrite {
    fn target(&self) -> ResourceId;

    /// Applies the write to the copy that belongs to `frame`. Only called while
    /// that copy is not in use by the GPU.
    fn apply(&self, frame: FrameIndex) -> RenderResult<()>;

    /// Number of per-frame copies the target has, if the write knows it.
    fn copy_count(&self) -> Option<usize> {
        None
    }
}

impl FrameWrite for Box<dyn FrameWrite> {
    fn target(&self) -> ResourceId {
        self.as_ref().target()
    }

    fn copy_count(&self) -> Option<usize> {
        self.as_ref().copy_count()
    }

    fn apply(&self, frame: FrameIndex) -> RenderResult<()> {
        self.as_ref().apply(frame)
    }
}

/// A resource with one host-writable copy per frame in flight.
pub trait FrameCopies {
    fn id(&self) -> ResourceId;

    fn copy_count(&self) -> usize;

    fn copy_size(&self) -> u64;

    fn write_copy(&self, frame: FrameIndex, offset: u64, data: &[u8]) -> RenderResult<()>;
}

/// Byte range write into a [`FrameCopies`] resource, usually a uniform buffer.
pub struct UniformWrite<B: ?Sized> {
    target: Arc<B>,
    offset: u64,
    data: Vec<u8>,
}

impl<B: FrameCopies + ?Sized> UniformWrite<B> {
    pub fn new(target: Arc<B>, offset: u64, data: Vec<u8>) -> Self {
        Self {
            target,
            offset,
            data,
        }
    }
}

impl<B: FrameCopies + ?Sized> FrameWrite for UniformWrite<B> {
    fn target(&self) -> ResourceId {
        self.target.id()
    }

    fn apply(&self, frame: FrameIndex) -> RenderResult<()> {
        self.target.write_copy(frame, self.offset, &self.data)
    }

    fn copy_count(&self) -> Option<usize> {
        Some(self.target.copy_count())
    }
}

#[derive(Debug)]
pub struct PendingUpdate<W> {
    write: W,
    next_update_frame: FrameIndex,
    updates_left: usize,
}

impl<W> PendingUpdate<W> {
    pub fn write(&self) -> &W {
        &self.write
    }

    pub fn next_update_frame(&self) -> FrameIndex {
        self.next_update_frame
    }

    pub fn updates_left(&self) -> usize {
        self.updates_left
    }
}

/// Replicates writes into all copies of N-buffered resources, one copy per frame.
///
/// A write requested while frame `f` is current first lands in copy `f + 1`, then
/// in every following copy until all `N` have seen it. Entries are kept in request
/// order and are never merged, so a later write to the same resource always lands
/// after an earlier one in every copy.
pub struct DeferredUpdateQueue<W> {
    entries: VecDeque<PendingUpdate<W>>,
    frame_count: usize,
}

impl<W: FrameWrite> DeferredUpdateQueue<W> {
    pub fn new(frame_count: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            frame_count,
        }
    }

    pub fn request(&mut self, write: W, cursor: &FrameCursor) {
        debug_assert_eq!(cursor.frame_count(), self.frame_count);
        self.entries.push_back(PendingUpdate {
            write,
            next_update_frame: cursor.next(),
            updates_left: self.frame_count,
        });
    }

    /// Applies every entry that is waiting for `current`, returning how many
    /// writes were issued.
    pub fn drain(&mut self, current: FrameIndex) -> usize {
        if self.entries.is_empty() {
            return 0;
        }

        let frame_count = self.frame_count;
        let mut applied = 0;
        for entry in self.entries.iter_mut() {
            if entry.next_update_frame != current {
                continue;
            }
            if let Err(err) = entry.write.apply(current) {
                log::error!(
                    "Deferred write to {:?} for frame {} failed: {}",
                    entry.write.target(),
                    current.index(),
                    err
                );
            }
            applied += 1;
            entry.updates_left -= 1;
            entry.next_update_frame = FrameIndex::new((current.index() + 1) % frame_count);
        }
        self.entries.retain(|entry| entry.updates_left > 0);
        applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_for(&self, target: ResourceId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.write.target() == target)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingUpdate<W>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;

    struct LoggedWrite {
        id: ResourceId,
        tag: u32,
        log: Rc<RefCell<Vec<(u32, usize)>>>,
    }

    impl FrameWrite for LoggedWrite {
        fn target(&self) -> ResourceId {
            self.id
        }

        fn apply(&self, frame: FrameIndex) -> RenderResult<()> {
            self.log.borrow_mut().push((self.tag, frame.index()));
            Ok(())
        }
    }

    fn logged(
        id: ResourceId,
        tag: u32,
        log: &Rc<RefCell<Vec<(u32, usize)>>>,
    ) -> LoggedWrite {
        LoggedWrite {
            id,
            tag,
            log: log.clone(),
        }
    }

    #[test]
    fn draining_an_empty_queue_does_nothing() {
        let mut queue: DeferredUpdateQueue<LoggedWrite> = DeferredUpdateQueue::new(2);
        assert_eq!(queue.drain(FrameIndex::new(0)), 0);
        assert_eq!(queue.drain(FrameIndex::new(1)), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn write_starts_at_next_frame_and_visits_every_copy_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut cursor = FrameCursor::new(3);
        let mut queue = DeferredUpdateQueue::new(3);
        let id = ResourceId::next();

        queue.request(logged(id, 7, &log), &cursor);
        assert_eq!(queue.iter().next().map(|e| e.updates_left()), Some(3));
        assert_eq!(queue.iter().next().map(|e| e.write().tag), Some(7));
        assert_eq!(
            queue.iter().next().map(|e| e.next_update_frame()),
            Some(FrameIndex::new(1))
        );

        // The current frame is left alone.
        assert_eq!(queue.drain(cursor.current()), 0);

        for _ in 0..3 {
            cursor.advance();
            assert_eq!(queue.drain(cursor.current()), 1);
        }
        assert!(queue.is_empty());
        assert_eq!(*log.borrow(), vec![(7, 1), (7, 2), (7, 0)]);
    }

    #[test]
    fn later_writes_land_after_earlier_ones_in_every_copy() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut cursor = FrameCursor::new(2);
        let mut queue = DeferredUpdateQueue::new(2);
        let id = ResourceId::next();

        queue.request(logged(id, 1, &log), &cursor);
        cursor.advance();
        queue.drain(cursor.current());
        queue.request(logged(id, 2, &log), &cursor);
        assert_eq!(queue.pending_for(id), 2);

        for _ in 0..3 {
            cursor.advance();
            queue.drain(cursor.current());
        }
        assert!(queue.is_empty());

        let log = log.borrow();
        for copy in 0..2 {
            let last = log.iter().filter(|(_, frame)| *frame == copy).last();
            assert_eq!(last.map(|(tag, _)| *tag), Some(2), "copy {copy}");
        }
        // Nothing is coalesced: 2 writes x 2 copies.
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn failed_writes_still_count_down() {
        struct Failing(ResourceId);
        impl FrameWrite for Failing {
            fn target(&self) -> ResourceId {
                self.0
            }
            fn apply(&self, _frame: FrameIndex) -> RenderResult<()> {
                Err(crate::error::RenderError::DeviceLost)
            }
        }

        let mut cursor = FrameCursor::new(2);
        let mut queue = DeferredUpdateQueue::new(2);
        queue.request(Failing(ResourceId::next()), &cursor);
        cursor.advance();
        queue.drain(cursor.current());
        cursor.advance();
        queue.drain(cursor.current());
        assert!(queue.is_empty());
    }
}
