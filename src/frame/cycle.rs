use std::sync::Arc;

use crate::{
    error::{RenderError, RenderResult},
    update_queue::{DeferredUpdateQueue, FrameCopies, FrameWrite, UniformWrite},
};

use super::{AcquiredImage, FrameCursor, FrameIndex, FrameSynchronizer};

/// Handed to whoever records the frame's rendering commands.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<C> {
    pub frame: FrameIndex,
    pub image_index: u32,
    pub command_buffer: C,
}

#[derive(Debug)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
    SubmitFailed(RenderError),
    PresentFailed(RenderError),
}

impl PresentOutcome {
    /// Whether the caller should think about recreating the swapchain.
    ///
    /// A failed submission leaves its image acquired but never presented, only a
    /// new swapchain gives it back.
    pub fn wants_new_swapchain(&self) -> bool {
        matches!(
            self,
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate | PresentOutcome::SubmitFailed(_)
        )
    }
}

#[derive(Debug)]
pub struct FrameReport {
    pub frame: FrameIndex,
    pub image_index: u32,
    pub updates_applied: usize,
    pub outcome: PresentOutcome,
}

struct InFlight<C> {
    frame: FrameIndex,
    image: AcquiredImage,
    command_buffer: C,
    updates_applied: usize,
}

/// The draw loop. Owns the frame cursor and both deferred update queues, and is
/// the only thing that ever advances the cursor.
pub struct FrameCycle<S: FrameSynchronizer> {
    synchronizer: S,
    cursor: FrameCursor,
    descriptor_updates: DeferredUpdateQueue<Box<dyn FrameWrite>>,
    uniform_updates: DeferredUpdateQueue<Box<dyn FrameWrite>>,
    in_flight: Option<InFlight<S::CommandBuffer>>,
}

impl<S: FrameSynchronizer> FrameCycle<S> {
    pub fn new(synchronizer: S) -> Self {
        let frame_count = synchronizer.frame_count();
        Self {
            synchronizer,
            cursor: FrameCursor::new(frame_count),
            descriptor_updates: DeferredUpdateQueue::new(frame_count),
            uniform_updates: DeferredUpdateQueue::new(frame_count),
            in_flight: None,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.cursor.frame_count()
    }

    pub fn current_frame(&self) -> FrameIndex {
        self.cursor.current()
    }

    pub fn next_frame(&self) -> FrameIndex {
        self.cursor.next()
    }

    /// The command buffer of the frame being recorded, if any.
    pub fn current_command_buffer(&self) -> Option<S::CommandBuffer> {
        self.in_flight.as_ref().map(|f| f.command_buffer)
    }

    pub fn synchronizer(&self) -> &S {
        &self.synchronizer
    }

    pub fn synchronizer_mut(&mut self) -> &mut S {
        &mut self.synchronizer
    }

    /// Queues a full rewrite of a per-frame descriptor set.
    pub fn request_descriptor_set_update<W: FrameWrite + 'static>(
        &mut self,
        write: W,
    ) -> RenderResult<()> {
        self.check_copy_count(write.copy_count())?;
        self.descriptor_updates.request(Box::new(write), &self.cursor);
        Ok(())
    }

    /// Queues `data` to be written at `offset` into every copy of `target`.
    pub fn request_uniform_update<B: FrameCopies + 'static>(
        &mut self,
        target: &Arc<B>,
        offset: u64,
        data: &[u8],
    ) -> RenderResult<()> {
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > target.copy_size()) {
            return Err(RenderError::InvalidAccess(format!(
                "write of {} bytes at offset {} does not fit into {} bytes",
                data.len(),
                offset,
                target.copy_size()
            )));
        }
        self.check_copy_count(Some(target.copy_count()))?;

        self.uniform_updates.request(
            Box::new(UniformWrite::new(target.clone(), offset, data.to_vec())),
            &self.cursor,
        );
        Ok(())
    }

    pub fn pending_descriptor_updates(&self) -> usize {
        self.descriptor_updates.len()
    }

    pub fn pending_uniform_updates(&self) -> usize {
        self.uniform_updates.len()
    }

    pub fn pending_updates_for(&self, target: crate::update_queue::ResourceId) -> usize {
        self.descriptor_updates.pending_for(target) + self.uniform_updates.pending_for(target)
    }

    /// Runs one complete frame: [`begin_frame`](Self::begin_frame), `render`,
    /// [`end_frame`](Self::end_frame).
    pub fn draw_frame<F>(&mut self, render: F) -> RenderResult<FrameReport>
    where
        F: FnOnce(&mut Self, FrameContext<S::CommandBuffer>),
    {
        let context = self.begin_frame()?;
        render(self, context);
        self.end_frame()
    }

    /// Waits for the current slot, acquires an image, starts recording and
    /// applies the pending updates for this slot.
    ///
    /// Nothing is advanced when this fails, the same slot is used again next time.
    pub fn begin_frame(&mut self) -> RenderResult<FrameContext<S::CommandBuffer>> {
        assert!(
            self.in_flight.is_none(),
            "begin_frame called while a frame is being recorded"
        );
        let frame = self.cursor.current();

        self.synchronizer.wait_for_frame_fence(frame)?;
        let image = self.synchronizer.acquire_next_image(frame)?;

        let command_buffer = match self
            .synchronizer
            .reset_frame_fence(frame)
            .and_then(|_| self.synchronizer.begin_recording(frame, image))
        {
            Ok(command_buffer) => command_buffer,
            Err(err) => {
                self.abandon(frame);
                return Err(err);
            }
        };

        // The fence wait above proves this slot's copies are no longer read by the GPU.
        let updates_applied =
            self.descriptor_updates.drain(frame) + self.uniform_updates.drain(frame);
        if updates_applied > 0 {
            log::trace!(
                "Applied {} deferred writes for frame {}",
                updates_applied,
                frame.index()
            );
        }

        self.in_flight = Some(InFlight {
            frame,
            image,
            command_buffer,
            updates_applied,
        });

        Ok(FrameContext {
            frame,
            image_index: image.image_index,
            command_buffer,
        })
    }

    /// Ends recording, submits, presents and advances the cursor.
    ///
    /// Submission and presentation failures are logged and reported in the
    /// returned [`FrameReport`]; the cursor advances regardless.
    pub fn end_frame(&mut self) -> RenderResult<FrameReport> {
        let Some(InFlight {
            frame,
            image,
            updates_applied,
            ..
        }) = self.in_flight.take()
        else {
            panic!("end_frame called without begin_frame");
        };

        let submitted = self
            .synchronizer
            .end_recording(frame, image)
            .and_then(|_| self.synchronizer.submit(frame, image));

        let outcome = match submitted {
            Err(err) => {
                log::error!("Could not submit frame {}: {}", frame.index(), err);
                self.abandon(frame);
                PresentOutcome::SubmitFailed(err)
            }
            Ok(()) => match self.synchronizer.present(frame, image) {
                Ok(suboptimal) if suboptimal || image.suboptimal => {
                    log::warn!("Swapchain is suboptimal");
                    PresentOutcome::Suboptimal
                }
                Ok(_) => PresentOutcome::Presented,
                Err(RenderError::SurfaceOutOfDate) => {
                    log::warn!("Swapchain is out of date");
                    PresentOutcome::OutOfDate
                }
                Err(err) => {
                    log::error!("Could not present frame {}: {}", frame.index(), err);
                    PresentOutcome::PresentFailed(err)
                }
            },
        };

        self.cursor.advance();

        Ok(FrameReport {
            frame,
            image_index: image.image_index,
            updates_applied,
            outcome,
        })
    }

    fn check_copy_count(&self, copy_count: Option<usize>) -> RenderResult<()> {
        match copy_count {
            Some(count) if count != self.frame_count() => Err(RenderError::InvalidAccess(format!(
                "resource has {} copies but {} frames are in flight",
                count,
                self.frame_count()
            ))),
            _ => Ok(()),
        }
    }

    fn abandon(&mut self, frame: FrameIndex) {
        if let Err(err) = self.synchronizer.abandon(frame) {
            log::error!("Could not recover frame slot {}: {}", frame.index(), err);
        }
    }
}
