use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::{RenderError, RenderResult};
use crate::frame::FrameIndex;
use crate::update_queue::{FrameCopies, ResourceId};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::context::Context;

/// A host-visible uniform buffer with one copy per frame in flight.
///
/// Copies are only written through the deferred update queue, so the GPU never
/// reads a copy that is being written.
pub struct UniformBuffer {
    id: ResourceId,
    copies: Vec<Buffer<u8>>,
    size: vk::DeviceSize,
}

impl UniformBuffer {
    /// Creates `frame_count` copies, each starting out as `initial`.
    pub fn new(
        context: Arc<Context>,
        initial: &[u8],
        frame_count: usize,
        name: &str,
    ) -> RenderResult<Arc<Self>> {
        let size = initial.len() as vk::DeviceSize;
        let copies = (0..frame_count)
            .map(|frame| {
                let buffer: Buffer<u8> = Buffer::new(
                    context.clone(),
                    size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                    &format!("{name} #{frame}"),
                )?;
                buffer.copy_data(initial)?;
                Ok(buffer)
            })
            .collect::<RenderResult<Vec<_>>>()?;

        Ok(Arc::new(Self {
            id: ResourceId::next(),
            copies,
            size,
        }))
    }

    pub fn buffer(&self, frame: FrameIndex) -> &Buffer<u8> {
        &self.copies[frame.index()]
    }
}

impl FrameCopies for UniformBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn copy_count(&self) -> usize {
        self.copies.len()
    }

    fn copy_size(&self) -> u64 {
        self.size
    }

    fn write_copy(&self, frame: FrameIndex, offset: u64, data: &[u8]) -> RenderResult<()> {
        let copy = self.copies.get(frame.index()).ok_or_else(|| {
            RenderError::InvalidAccess(format!(
                "uniform buffer has no copy for frame {}",
                frame.index()
            ))
        })?;
        copy.get_untyped().write_bytes(offset, data)
    }
}
