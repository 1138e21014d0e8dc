#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use unnamed_engine::error::{RenderError, RenderResult};
use unnamed_engine::frame::{AcquiredImage, FrameIndex, FrameSynchronizer, SlotState};
use unnamed_engine::update_queue::{FrameCopies, FrameWrite, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Wait(usize),
    Acquire(usize, u32),
    Reset(usize),
    Begin(usize),
    End(usize),
    Submit(usize, u32),
    Present(usize, u32),
    Abandon(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Acquire,
    Begin,
    Submit,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fence {
    Signaled,
    Unsignaled,
    /// Submitted work that "finishes" as soon as someone waits for it.
    Pending,
}

/// Records every call and checks the slot and fence rules a real device would
/// rely on.
pub struct RecordingSynchronizer {
    pub calls: Vec<Call>,
    slots: Vec<SlotState>,
    fences: Vec<Fence>,
    image_count: u32,
    next_image: u32,
    failures: Vec<(Step, RenderError)>,
    suboptimal_presents: usize,
}

impl RecordingSynchronizer {
    pub fn new(frame_count: usize) -> Self {
        Self {
            calls: Vec::new(),
            slots: vec![SlotState::Idle; frame_count],
            fences: vec![Fence::Signaled; frame_count],
            image_count: frame_count as u32 + 1,
            next_image: 0,
            failures: Vec::new(),
            suboptimal_presents: 0,
        }
    }

    /// Makes the next call of `step` fail with `error`.
    pub fn fail_next(&mut self, step: Step, error: RenderError) {
        self.failures.push((step, error));
    }

    pub fn report_suboptimal_next(&mut self) {
        self.suboptimal_presents += 1;
    }

    pub fn slot_state(&self, frame: usize) -> SlotState {
        self.slots[frame]
    }

    fn take_failure(&mut self, step: Step) -> RenderResult<()> {
        match self.failures.iter().position(|(s, _)| *s == step) {
            Some(position) => Err(self.failures.remove(position).1),
            None => Ok(()),
        }
    }
}

impl FrameSynchronizer for RecordingSynchronizer {
    type CommandBuffer = usize;

    fn frame_count(&self) -> usize {
        self.slots.len()
    }

    fn wait_for_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let slot = frame.index();
        self.calls.push(Call::Wait(slot));
        if self.fences[slot] == Fence::Unsignaled {
            return Err(RenderError::InvalidAccess(format!(
                "waiting for fence {slot} that nothing will signal"
            )));
        }
        self.fences[slot] = Fence::Signaled;
        self.slots[slot].transition_to(SlotState::Idle);
        Ok(())
    }

    fn acquire_next_image(&mut self, frame: FrameIndex) -> RenderResult<AcquiredImage> {
        self.take_failure(Step::Acquire)?;
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        self.calls.push(Call::Acquire(frame.index(), image_index));
        self.slots[frame.index()].transition_to(SlotState::Acquired);
        Ok(AcquiredImage {
            image_index,
            suboptimal: false,
        })
    }

    fn reset_frame_fence(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let slot = frame.index();
        assert_eq!(
            self.fences[slot],
            Fence::Signaled,
            "fence {slot} reset before it was observed"
        );
        self.calls.push(Call::Reset(slot));
        self.fences[slot] = Fence::Unsignaled;
        Ok(())
    }

    fn begin_recording(
        &mut self,
        frame: FrameIndex,
        _image: AcquiredImage,
    ) -> RenderResult<usize> {
        self.take_failure(Step::Begin)?;
        self.calls.push(Call::Begin(frame.index()));
        self.slots[frame.index()].transition_to(SlotState::Recording);
        Ok(frame.index())
    }

    fn end_recording(&mut self, frame: FrameIndex, _image: AcquiredImage) -> RenderResult<()> {
        assert_eq!(self.slots[frame.index()], SlotState::Recording);
        self.calls.push(Call::End(frame.index()));
        Ok(())
    }

    fn submit(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<()> {
        self.take_failure(Step::Submit)?;
        let slot = frame.index();
        self.calls.push(Call::Submit(slot, image.image_index));
        self.slots[slot].transition_to(SlotState::Submitted);
        self.fences[slot] = Fence::Pending;
        Ok(())
    }

    fn present(&mut self, frame: FrameIndex, image: AcquiredImage) -> RenderResult<bool> {
        self.calls.push(Call::Present(frame.index(), image.image_index));
        self.slots[frame.index()].transition_to(SlotState::Presented);
        self.take_failure(Step::Present)?;
        if self.suboptimal_presents > 0 {
            self.suboptimal_presents -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn abandon(&mut self, frame: FrameIndex) -> RenderResult<()> {
        let slot = frame.index();
        self.calls.push(Call::Abandon(slot));
        self.fences[slot] = Fence::Signaled;
        self.slots[slot].abandon();
        Ok(())
    }
}

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// A host-side stand-in for an N-buffered uniform buffer.
pub struct FakeUniform {
    id: ResourceId,
    copies: Vec<Mutex<Vec<u8>>>,
    writes: Mutex<Vec<usize>>,
    journal: Journal,
}

impl FakeUniform {
    pub fn new(frame_count: usize, size: usize, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::next(),
            copies: (0..frame_count).map(|_| Mutex::new(vec![0; size])).collect(),
            writes: Mutex::new(Vec::new()),
            journal: journal.clone(),
        })
    }

    pub fn copy(&self, frame: usize) -> Vec<u8> {
        self.copies[frame].lock().unwrap().clone()
    }

    /// Frames whose copy was written, in write order.
    pub fn written_frames(&self) -> Vec<usize> {
        self.writes.lock().unwrap().clone()
    }
}

impl FrameCopies for FakeUniform {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn copy_count(&self) -> usize {
        self.copies.len()
    }

    fn copy_size(&self) -> u64 {
        self.copies[0].lock().unwrap().len() as u64
    }

    fn write_copy(&self, frame: FrameIndex, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut copy = self.copies[frame.index()].lock().unwrap();
        let offset = offset as usize;
        copy[offset..offset + data.len()].copy_from_slice(data);
        self.writes.lock().unwrap().push(frame.index());
        self.journal
            .lock()
            .unwrap()
            .push(format!("uniform:{}", frame.index()));
        Ok(())
    }
}

/// Stands in for a descriptor set rewrite.
pub struct FakeDescriptorRefresh {
    pub id: ResourceId,
    copies: usize,
    journal: Journal,
}

impl FakeDescriptorRefresh {
    pub fn new(copies: usize, journal: &Journal) -> Self {
        Self {
            id: ResourceId::next(),
            copies,
            journal: journal.clone(),
        }
    }
}

impl FrameWrite for FakeDescriptorRefresh {
    fn target(&self) -> ResourceId {
        self.id
    }

    fn copy_count(&self) -> Option<usize> {
        Some(self.copies)
    }

    fn apply(&self, frame: FrameIndex) -> RenderResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("descriptor:{}", frame.index()));
        Ok(())
    }
}
