use crate::error::RenderResult;

use super::FrameIndex;

/// Lifecycle of one frame slot.
///
/// `Idle → Acquired → Recording → Submitted → Presented → Idle`. A slot only
/// returns to `Idle` once its fence has been observed, and only an `Idle` slot
/// may acquire again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquired,
    Recording,
    Submitted,
    Presented,
}

impl SlotState {
    pub fn can_transition_to(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Acquired)
                | (Acquired, Recording)
                | (Recording, Submitted)
                | (Submitted, Presented)
                // fence observed
                | (Presented, Idle)
                | (Idle, Idle)
        )
    }

    pub fn transition_to(&mut self, next: SlotState) {
        assert!(
            self.can_transition_to(next),
            "Illegal frame slot transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }

    /// Drops whatever the slot was doing. Only valid when the implementation has
    /// made sure the slot's fence is signaled again.
    pub fn abandon(&mut self) {
        *self = SlotState::Idle;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub image_index: u32,
    pub suboptimal: bool,
}

/// The GPU facing half of the draw loop.
///
/// All methods are called from the render thread, in the order
/// [`FrameCycle::draw_frame`](super::FrameCycle::draw_frame) documents.
pub trait FrameSynchronizer {
    type CommandBuffer: Copy;

    fn frame_count(&self) -> usize;

    /// Blocks until the GPU retired everything previously submitted for `frame`.
    fn wait_for_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()>;

    /// Asks the presentation engine for an image, signaling `frame`'s
    /// image-available semaphore once it's ready.
    fn acquire_next_image(&mut self, frame: FrameIndex) -> RenderResult<AcquiredImage>;

    fn reset_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()>;

    /// Resets and begins `frame`'s command buffer, including the default clear pass.
    fn begin_recording(
        &mut self,
        frame: FrameIndex,
        image: AcquiredImage,
    ) -> RenderResult<Self::CommandBuffer>;

    fn end_recording(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<()>;

    /// Submits `frame`'s command buffer. Signals the render-finished semaphore
    /// of the swapchain image and the slot's fence.
    fn submit(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<()>;

    /// Returns whether the surface reported itself as suboptimal.
    fn present(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<bool>;

    /// Returns a slot whose frame failed between fence reset and submission to
    /// `Idle`, with its fence signaled so the next wait cannot dead-lock. The
    /// image acquired for the frame is not presented.
    fn abandon(&mut self, frame: FrameIndex) -> RenderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_is_legal() {
        let mut state = SlotState::Idle;
        for next in [
            SlotState::Idle,
            SlotState::Acquired,
            SlotState::Recording,
            SlotState::Submitted,
            SlotState::Presented,
            SlotState::Idle,
        ] {
            state.transition_to(next);
        }
        assert_eq!(state, SlotState::Idle);
    }

    #[test]
    #[should_panic(expected = "Illegal frame slot transition")]
    fn presented_slot_cannot_be_reacquired_without_fence() {
        let mut state = SlotState::Presented;
        state.transition_to(SlotState::Acquired);
    }

    #[test]
    fn skipping_submission_is_illegal() {
        assert!(!SlotState::Recording.can_transition_to(SlotState::Presented));
        assert!(!SlotState::Acquired.can_transition_to(SlotState::Submitted));
        assert!(!SlotState::Submitted.can_transition_to(SlotState::Idle));
    }

    #[test]
    fn abandon_returns_to_idle() {
        let mut state = SlotState::Recording;
        state.abandon();
        assert_eq!(state, SlotState::Idle);
    }
}
